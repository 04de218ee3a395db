//! Default processor used when the daemon runs standalone.

use std::sync::Arc;

use pipeline::{ProcessError, ProcessingSummary, ResultProcessor, ResultSource, result_processor};

/// Counts the records in a result file without applying them anywhere.
///
/// A record is a non-empty line after the header. Content that is not UTF-8
/// can never succeed, so it is a permanent failure.
pub fn line_counter() -> Arc<dyn ResultProcessor> {
    Arc::new(result_processor!(|source| {
        let records = count_records(&source)?;
        tracing::info!(origin = %source.origin, bytes = source.len(), records, "Result file counted");
        Ok(ProcessingSummary::records(records))
    }))
}

fn count_records(source: &ResultSource) -> Result<usize, ProcessError> {
    let text = std::str::from_utf8(source.content.get_ref())
        .map_err(|e| ProcessError::Permanent(format!("result file is not UTF-8: {e}")))?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .skip(1)
        .count())
}
