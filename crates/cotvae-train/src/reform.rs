//! Two-problems-per-line data reformatting.
//!
//! Consecutive lines `p1||t1####a1` and `p2||t2####a2` become
//! `p1, p2||t1,t2####a1,a2`. Segments are copied verbatim, so spacing
//! around the markers is preserved.

use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::Path;

use tracing::{info, warn};

use crate::error::{TrainError, TrainResult};

struct RawSegments<'a> {
    problem: &'a str,
    trace: &'a str,
    answer: &'a str,
}

fn raw_segments(line: &str) -> Result<RawSegments<'_>, String> {
    let (problem, rest) = line.split_once("||").ok_or("missing '||'")?;
    let (trace, answer) = rest.split_once("####").ok_or("missing '####'")?;
    Ok(RawSegments { problem, trace, answer })
}

/// Merge two example lines (without trailing newlines) into one.
pub fn combine_pair(first: &str, second: &str) -> Result<String, String> {
    let a = raw_segments(first)?;
    let b = raw_segments(second)?;
    Ok(format!(
        "{}, {}||{},{}####{},{}",
        a.problem, b.problem, a.trace, b.trace, a.answer, b.answer
    ))
}

/// Write `num_lines` combined lines built from the first `2 * num_lines`
/// lines of `input`. Stops early, with a warning, when `input` runs out.
/// Returns the number of lines written.
pub fn reform_file(input: &Path, output: &Path, num_lines: usize) -> TrainResult<usize> {
    let reader = io::BufReader::new(fs::File::open(input)?);
    let mut writer = BufWriter::new(fs::File::create(output)?);
    let mut lines = reader.lines().enumerate();

    let mut written = 0usize;
    while written < num_lines {
        let (Some((i, first)), Some((j, second))) = (lines.next(), lines.next()) else {
            warn!(written, requested = num_lines, "Input exhausted before all lines were combined");
            break;
        };
        let (first, second) = (first?, second?);
        let first = first.trim_end_matches(['\r', '\n']);
        let second = second.trim_end_matches(['\r', '\n']);

        let combined = combine_pair(first, second).map_err(|reason| TrainError::Data {
            path: input.to_path_buf(),
            line: if raw_segments(first).is_err() { i + 1 } else { j + 1 },
            reason,
        })?;
        writeln!(writer, "{combined}")?;
        written += 1;
    }
    writer.flush()?;

    info!(input = %input.display(), output = %output.display(), written, "Reformatted data");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn pairs_are_joined_segment_by_segment() {
        let out = combine_pair("1 + 2||1 + 2 = 3 #### 3", "2 * 2||2 * 2 = 4 #### 4").unwrap();
        assert_eq!(out, "1 + 2, 2 * 2||1 + 2 = 3 ,2 * 2 = 4 #### 3, 4");
    }

    #[test]
    fn malformed_pair_is_rejected() {
        assert!(combine_pair("no markers", "1||1####1").is_err());
        assert!(combine_pair("1||1####1", "1||1").is_err());
    }

    #[test]
    fn file_reform_writes_requested_lines() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "a||b####c\nd||e####f\ng||h####i\nj||k####l\n").unwrap();

        assert_eq!(reform_file(&input, &output, 2).unwrap(), 2);
        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text, "a, d||b,e####c,f\ng, j||h,k####i,l\n");
    }

    #[test]
    fn short_input_stops_early() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "a||b####c\nd||e####f\ng||h####i\n").unwrap();

        assert_eq!(reform_file(&input, &output, 5).unwrap(), 1);
    }

    #[test]
    fn malformed_line_is_located() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        fs::write(&input, "a||b####c\nbroken\n").unwrap();

        match reform_file(&input, &output, 1) {
            Err(TrainError::Data { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected data error, got {other:?}"),
        }
    }
}
