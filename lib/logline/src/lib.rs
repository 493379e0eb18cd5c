//! Normalization of raw Docker log lines.
//!
//! Accepts lines in any of the shapes the engine produces:
//! optionally prefixed with the 8 byte stream-multiplex header,
//! optionally prefixed with an RFC3339Nano timestamp, and (for
//! compose projects) prefixed with `service | `. Malformed input
//! never panics, each step falls back to the best partial result.

use dockhand_client::entities::logs::LogLevel;

/// Stream multiplex header: `[stream, 0, 0, 0, len_be_u32]`.
const MUX_HEADER_LEN: usize = 8;
const MUX_STDERR: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedLine {
  pub level: LogLevel,
  pub service: Option<String>,
  pub message: String,
  /// RFC3339 as written by the engine, or empty when the line
  /// carried no timestamp.
  pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeOptions {
  /// Split a `service | ` prefix off the line.
  pub project: bool,
  /// The line is known to come from stderr (already demultiplexed
  /// upstream). A multiplex header on the line itself overrides
  /// this.
  pub stderr: bool,
}

pub fn normalize(
  raw: &str,
  options: NormalizeOptions,
) -> NormalizedLine {
  let (rest, header_stderr) = strip_mux_header(raw);
  let default_level = if header_stderr.unwrap_or(options.stderr) {
    LogLevel::Warn
  } else {
    LogLevel::Info
  };

  let rest = rest
    .strip_suffix('\n')
    .map(|rest| rest.strip_suffix('\r').unwrap_or(rest))
    .unwrap_or(rest);

  let (service, rest) = if options.project {
    split_service(rest)
  } else {
    (None, rest)
  };

  let (timestamp, message) = split_timestamp(rest);

  NormalizedLine {
    level: detect_level(message, default_level),
    service,
    message: message.to_string(),
    timestamp: timestamp.unwrap_or_default().to_string(),
  }
}

/// Strip the engine's stream-multiplex header when the first 8
/// bytes match its layout. Returns whether the header marked the
/// line as stderr.
fn strip_mux_header(raw: &str) -> (&str, Option<bool>) {
  let bytes = raw.as_bytes();
  if bytes.len() < MUX_HEADER_LEN
    || bytes[0] > MUX_STDERR
    || bytes[1..4] != [0, 0, 0]
  {
    return (raw, None);
  }
  let stderr = bytes[0] == MUX_STDERR;
  // The length bytes may have been mangled by lossy decoding,
  // leaving byte 8 inside a replacement char.
  match raw.get(MUX_HEADER_LEN..) {
    Some(rest) => (rest, Some(stderr)),
    None => (raw, None),
  }
}

fn split_service(rest: &str) -> (Option<String>, &str) {
  match rest.split_once("| ") {
    Some((service, rest)) => {
      let service = service.trim();
      if service.is_empty() {
        (None, rest)
      } else {
        (Some(service.to_string()), rest)
      }
    }
    None => (None, rest),
  }
}

/// Extract a leading RFC3339(Nano) token when present and valid.
fn split_timestamp(rest: &str) -> (Option<&str>, &str) {
  let (token, message) = match rest.split_once(' ') {
    Some((token, message)) => (token, message),
    None => (rest, ""),
  };
  if chrono::DateTime::parse_from_rfc3339(token).is_ok() {
    (Some(token), message)
  } else {
    (None, rest)
  }
}

/// Case-insensitive content heuristic. Rules are applied in
/// order, the first matching group wins.
fn detect_level(message: &str, default: LogLevel) -> LogLevel {
  let lower = message.to_lowercase();
  if ["error", "err", "fatal"].iter().any(|m| lower.contains(m)) {
    LogLevel::Error
  } else if ["warn", "warning"].iter().any(|m| lower.contains(m)) {
    LogLevel::Warn
  } else if ["debug", "trace"].iter().any(|m| lower.contains(m)) {
    LogLevel::Debug
  } else {
    default
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn container(raw: &str) -> NormalizedLine {
    normalize(raw, NormalizeOptions::default())
  }

  fn project(raw: &str) -> NormalizedLine {
    normalize(
      raw,
      NormalizeOptions {
        project: true,
        stderr: false,
      },
    )
  }

  #[test]
  fn plain_line_defaults_to_info() {
    let line = container("listening on :8080\n");
    assert_eq!(line.level, LogLevel::Info);
    assert_eq!(line.message, "listening on :8080");
    assert_eq!(line.service, None);
    assert_eq!(line.timestamp, "");
  }

  #[test]
  fn project_line_with_timestamp_and_level() {
    let line = project(
      "web     | 2024-06-01T12:00:00.000000000Z level=ERROR something broke\n",
    );
    assert_eq!(line.service.as_deref(), Some("web"));
    assert_eq!(line.level, LogLevel::Error);
    assert_eq!(line.timestamp, "2024-06-01T12:00:00.000000000Z");
    assert_eq!(line.message, "level=ERROR something broke");
  }

  #[test]
  fn mux_header_stderr_defaults_to_warn() {
    let mut raw = vec![2u8, 0, 0, 0, 0, 0, 0, 14];
    raw.extend_from_slice(b"starting up\r\n");
    let raw = String::from_utf8(raw).unwrap();
    let line = container(&raw);
    assert_eq!(line.level, LogLevel::Warn);
    assert_eq!(line.message, "starting up");
  }

  #[test]
  fn mux_header_stdout_stays_info() {
    let mut raw = vec![1u8, 0, 0, 0, 0, 0, 0, 3];
    raw.extend_from_slice(b"ok\n");
    let raw = String::from_utf8(raw).unwrap();
    let line = container(&raw);
    assert_eq!(line.level, LogLevel::Info);
    assert_eq!(line.message, "ok");
  }

  #[test]
  fn stderr_option_maps_to_warn() {
    let line = normalize(
      "something happened\n",
      NormalizeOptions {
        project: false,
        stderr: true,
      },
    );
    assert_eq!(line.level, LogLevel::Warn);
  }

  #[test]
  fn content_level_overrides_stream_default() {
    let line = normalize(
      "debug: cache miss\n",
      NormalizeOptions {
        project: false,
        stderr: true,
      },
    );
    assert_eq!(line.level, LogLevel::Debug);
  }

  #[test]
  fn error_rule_wins_over_warn_rule() {
    let line = container("warning: request errored\n");
    assert_eq!(line.level, LogLevel::Error);
  }

  #[test]
  fn invalid_timestamp_token_stays_in_message() {
    let line = container("2024-13-99T99:99:99Z not a timestamp");
    assert_eq!(line.timestamp, "");
    assert_eq!(line.message, "2024-13-99T99:99:99Z not a timestamp");
  }

  #[test]
  fn timestamp_only_line_yields_empty_message() {
    let line = container("2024-06-01T12:00:00Z");
    assert_eq!(line.timestamp, "2024-06-01T12:00:00Z");
    assert_eq!(line.message, "");
    assert_eq!(line.level, LogLevel::Info);
  }

  #[test]
  fn project_line_without_separator_has_no_service() {
    let line = project("standalone output\n");
    assert_eq!(line.service, None);
    assert_eq!(line.message, "standalone output");
  }

  #[test]
  fn short_or_malformed_input_never_panics() {
    for raw in ["", "\n", "|", "x", "\u{1}\u{0}"] {
      let _ = container(raw);
      let _ = project(raw);
    }
  }
}
