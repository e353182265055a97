use anyhow::Result;
use serde::Serialize;

use crate::normalization::color::{normalize_color, NormalizedColor};
use crate::normalization::filename::{FilenameParser, ParseFailure, ParsedFilename};

#[derive(Debug, Clone, Default)]
pub struct ParseConfig {
    pub filenames: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ParseLine<'a> {
    filename: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parsed: Option<ParsedFilename>,
    #[serde(skip_serializing_if = "Option::is_none")]
    color: Option<NormalizedColor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<ParseFailure>,
}

fn describe<'a>(parser: &FilenameParser, filename: &'a str) -> ParseLine<'a> {
    match parser.parse(filename) {
        Ok(parsed) => ParseLine {
            filename,
            color: Some(normalize_color(&parsed.color_token)),
            parsed: Some(parsed),
            failure: None,
        },
        Err(failure) => ParseLine {
            filename,
            parsed: None,
            color: None,
            failure: Some(failure),
        },
    }
}

/// Print one JSON line per filename: the parse and the normalized color, or the failure.
pub async fn run(cfg: ParseConfig) -> Result<()> {
    let parser = FilenameParser::with_defaults();
    for name in &cfg.filenames {
        println!("{}", serde_json::to_string(&describe(&parser, name))?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_success_and_failure() {
        let parser = FilenameParser::with_defaults();
        let ok = serde_json::to_value(describe(&parser, "PD760221_BLO_2.jpg")).unwrap();
        assert_eq!(ok["parsed"]["model_ref"], "PD760221");
        assert_eq!(ok["color"]["base"], "BLO");
        assert!(ok.get("failure").is_none());

        let bad = serde_json::to_value(describe(&parser, "banner.jpg")).unwrap();
        assert_eq!(bad["failure"], "no_delimiter");
    }
}
