use std::path::Path;

use super::constants::MAX_RUN_TIME_ADDITIONS;
use super::destination::Destination;
use super::error::RunTimeConfigError;

/// One extra register write loaded at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimeWrite {
    pub destination: Destination,
    pub address: u32,
    pub data: u32,
}

/// Parse run time config additions: whitespace separated hex `dest addr data` triples, one per
/// line. Blank lines and lines starting with `#` are ignored. At most 1024 writes are kept.
pub fn parse_run_time_additions(contents: &str) -> Result<Vec<RunTimeWrite>, RunTimeConfigError> {
    let mut writes = Vec::new();
    for (line_number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if writes.len() == MAX_RUN_TIME_ADDITIONS {
            spdlog::warn!(
                "Run time config has more than {} writes, ignoring the rest",
                MAX_RUN_TIME_ADDITIONS
            );
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(RunTimeConfigError::BadLine(line_number + 1, line.to_string()));
        }
        writes.push(RunTimeWrite {
            destination: Destination::from_code(parse_hex(fields[0])?),
            address: parse_hex(fields[1])?,
            data: parse_hex(fields[2])?,
        });
    }
    Ok(writes)
}

fn parse_hex(field: &str) -> Result<u32, RunTimeConfigError> {
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    Ok(u32::from_str_radix(digits, 16)?)
}

pub fn read_run_time_additions(path: &Path) -> Result<Vec<RunTimeWrite>, RunTimeConfigError> {
    if !path.exists() {
        return Err(RunTimeConfigError::BadFilePath(path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(path)?;
    parse_run_time_additions(&contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::VirtualChannel;

    #[test]
    fn test_parse_additions() {
        let text = "# lane 1 registers\n5 0x3e 1\n\n4 1c 0xABC\n";
        let writes = parse_run_time_additions(text).unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[0].destination,
            Destination::new(1, VirtualChannel::Registers)
        );
        assert_eq!(writes[0].address, 0x3e);
        assert_eq!(writes[1].destination.vc(), VirtualChannel::Data);
        assert_eq!(writes[1].data, 0xabc);
    }

    #[test]
    fn test_bad_line() {
        assert!(matches!(
            parse_run_time_additions("5 3e\n"),
            Err(RunTimeConfigError::BadLine(1, _))
        ));
        assert!(matches!(
            parse_run_time_additions("5 3e zz\n"),
            Err(RunTimeConfigError::ParsingError(_))
        ));
    }

    #[test]
    fn test_limit() {
        let text = "1 2 3\n".repeat(MAX_RUN_TIME_ADDITIONS + 10);
        assert_eq!(
            parse_run_time_additions(&text).unwrap().len(),
            MAX_RUN_TIME_ADDITIONS
        );
    }
}
