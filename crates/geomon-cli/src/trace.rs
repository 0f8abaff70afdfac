//! Plain-text trace files.
//!
//! One record per line: `ts sid hid key op`, whitespace separated, with
//! `op` either `INSERT`/`DELETE` or `+`/`-`. Lines that are empty or
//! start with `#` are skipped.

use anyhow::{bail, Context, Result};
use geomon_core::types::{Record, StreamOp};
use std::fs;
use std::path::Path;

pub fn read_trace(path: &Path) -> Result<Vec<Record>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading trace file {}", path.display()))?;
    let mut records: Vec<Record> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rec = parse_line(line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        if let Some(prev) = records.last() {
            if rec.ts < prev.ts {
                bail!(
                    "{}:{}: timestamps must be non-decreasing ({} after {})",
                    path.display(),
                    lineno + 1,
                    rec.ts,
                    prev.ts
                );
            }
        }
        records.push(rec);
    }
    Ok(records)
}

fn parse_line(line: &str) -> Result<Record> {
    let mut fields = line.split_whitespace();
    let mut next = |name: &'static str| {
        fields
            .next()
            .with_context(|| format!("missing field `{name}`"))
    };
    let ts = next("ts")?.parse().context("parsing `ts`")?;
    let sid = next("sid")?.parse().context("parsing `sid`")?;
    let hid = next("hid")?.parse().context("parsing `hid`")?;
    let key = next("key")?.parse().context("parsing `key`")?;
    let op = match next("op")? {
        "INSERT" | "+" => StreamOp::Insert,
        "DELETE" | "-" => StreamOp::Delete,
        other => bail!("unknown op `{other}`"),
    };
    Ok(Record::new(ts, sid, hid, key, op))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_both_op_spellings() {
        let f = write_temp("# header\n1 0 0 42 INSERT\n2 0 1 42 -\n\n");
        let recs = read_trace(f.path()).unwrap();
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].op, StreamOp::Insert);
        assert_eq!(recs[1].op, StreamOp::Delete);
        assert_eq!(recs[1].hid, 1);
    }

    #[test]
    fn rejects_time_travel() {
        let f = write_temp("5 0 0 1 +\n3 0 0 1 +\n");
        assert!(read_trace(f.path()).is_err());
    }

    #[test]
    fn reports_the_offending_line() {
        let f = write_temp("1 0 0 42 FROB\n");
        let err = format!("{:#}", read_trace(f.path()).unwrap_err());
        assert!(err.contains(":1"), "error was: {err}");
    }
}
