//! Recover report metadata from a report filename.
//!
//! Report files are named `YYYY-MM-DD_HH-MM-SS_Testresult...html`. The
//! timestamp before the `_Testresult` marker becomes the report's creation
//! time (interpreted as UTC) and the verdict comes from whether the name
//! mentions "error".

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::model::types::Verdict;

/// Token separating the timestamp prefix from the rest of the name.
pub const RESULT_MARKER: &str = "_Testresult";

/// `strftime` layout of the timestamp prefix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReportNameError {
    #[error("'{name}' has no '_Testresult' marker")]
    MissingMarker { name: String },

    #[error("'{prefix}' in '{name}' is not a YYYY-MM-DD_HH-MM-SS timestamp")]
    BadTimestamp { name: String, prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReportName {
    pub created: DateTime<Utc>,
    pub verdict: Verdict,
}

/// Parse a report filename (a bare name or a path; only the base name is used).
pub fn parse_report_name(name: &str) -> Result<ParsedReportName, ReportNameError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let Some((prefix, _)) = base.split_once(RESULT_MARKER) else {
        return Err(ReportNameError::MissingMarker {
            name: base.to_string(),
        });
    };

    let naive = NaiveDateTime::parse_from_str(prefix, TIMESTAMP_FORMAT).map_err(|_| {
        ReportNameError::BadTimestamp {
            name: base.to_string(),
            prefix: prefix.to_string(),
        }
    })?;

    Ok(ParsedReportName {
        created: naive.and_utc(),
        verdict: Verdict::from_filename(base),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_passing_report() {
        let parsed = parse_report_name("2024-01-01_10-00-00_Testresult.html").unwrap();
        assert_eq!(
            parsed.created,
            Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(parsed.verdict, Verdict::Passed);
    }

    #[test]
    fn parses_failing_report() {
        let parsed = parse_report_name("2024-01-02_09-30-00_Testresult_error.html").unwrap();
        assert_eq!(
            parsed.created,
            Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap()
        );
        assert_eq!(parsed.verdict, Verdict::Failed);
    }

    #[test]
    fn uses_base_name_of_paths() {
        let parsed =
            parse_report_name("/media/rack-01/2024-03-04_05-06-07_Testresult_ERROR.html").unwrap();
        assert_eq!(parsed.verdict, Verdict::Failed);
        assert_eq!(
            parsed.created,
            Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap()
        );
    }

    #[test]
    fn error_in_directory_name_does_not_fail_report() {
        let parsed =
            parse_report_name("/srv/errors/2024-03-04_05-06-07_Testresult.html").unwrap();
        assert_eq!(parsed.verdict, Verdict::Passed);
    }

    #[test]
    fn missing_marker_is_rejected() {
        assert_eq!(
            parse_report_name("2024-01-01_10-00-00.html"),
            Err(ReportNameError::MissingMarker {
                name: "2024-01-01_10-00-00.html".into()
            })
        );
    }

    #[test]
    fn malformed_timestamp_is_rejected() {
        for name in [
            "yesterday_Testresult.html",
            "2024-13-01_10-00-00_Testresult.html",
            "2024-01-01 10:00:00_Testresult.html",
            "_Testresult.html",
        ] {
            assert!(
                matches!(
                    parse_report_name(name),
                    Err(ReportNameError::BadTimestamp { .. })
                ),
                "{name} should not parse"
            );
        }
    }
}
