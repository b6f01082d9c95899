//! `V:<vy>,<vx>` line codec shared by the controller, relay and bridge.

use intercept::VelocityCommand;
use thiserror::Error;

pub const COMMAND_TAG: &str = "V:";
pub const LINE_TERMINATOR: char = '\n';

/// Latency check answered by the relay and never forwarded.
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("missing `V:` tag")]
    MissingTag,
    #[error("missing `,` between vy and vx")]
    MissingSeparator,
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

/// Three decimals, no terminator. Negative zero is written as `0.000`.
pub fn encode(command: &VelocityCommand) -> String {
    format!(
        "{COMMAND_TAG}{:.3},{:.3}",
        positive_zero(command.vy),
        positive_zero(command.vx)
    )
}

/// Rounds first so tiny negatives do not print as `-0.000`.
fn positive_zero(value: f64) -> f64 {
    let rounded = (value * 1000.0).round() / 1000.0;
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// `line` without its trailing `\n` or `\r\n`.
pub fn strip_terminator(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

/// Check that `line` is a well-formed command without building one.
pub fn validate(line: &str) -> Result<(), ProtocolError> {
    split_fields(strip_terminator(line)).and_then(|(vy, vx)| {
        parse_number(vy)?;
        parse_number(vx)?;
        Ok(())
    })
}

/// Parse a command line, clamping both components into `[-1, 1]`.
pub fn parse(line: &str) -> Result<VelocityCommand, ProtocolError> {
    let (vy, vx) = split_fields(strip_terminator(line))?;
    Ok(VelocityCommand::new(parse_number(vy)?, parse_number(vx)?))
}

fn split_fields(line: &str) -> Result<(&str, &str), ProtocolError> {
    let tag_len = COMMAND_TAG.len();
    let body = match line.get(..tag_len) {
        Some(tag) if tag.eq_ignore_ascii_case(COMMAND_TAG) => &line[tag_len..],
        _ => return Err(ProtocolError::MissingTag),
    };
    body.split_once(',').ok_or(ProtocolError::MissingSeparator)
}

fn parse_number(field: &str) -> Result<f64, ProtocolError> {
    let field = field.trim();
    match field.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(ProtocolError::InvalidNumber(field.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_three_decimals_without_negative_zero() {
        assert_eq!(encode(&VelocityCommand::new(0.5, -0.25)), "V:0.500,-0.250");
        assert_eq!(encode(&VelocityCommand::new(-0.0, -0.0001)), "V:0.000,0.000");
        assert_eq!(encode(&VelocityCommand::STOP), "V:0.000,0.000");
    }

    #[test]
    fn parses_case_insensitive_tag() {
        let command = parse("v:1.0,-0.5\n").unwrap();
        assert_eq!(command, VelocityCommand::new(1.0, -0.5));
        assert_eq!(parse("V: 2.5 , 0").unwrap().vy, 1.0);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(validate("XYZZY"), Err(ProtocolError::MissingTag));
        assert_eq!(validate(""), Err(ProtocolError::MissingTag));
        assert_eq!(validate("V:0.5"), Err(ProtocolError::MissingSeparator));
        assert_eq!(
            validate("V:up,0.1"),
            Err(ProtocolError::InvalidNumber("up".into()))
        );
        assert!(matches!(validate("V:inf,0"), Err(ProtocolError::InvalidNumber(_))));
        assert!(validate("V:0.5,-0.25").is_ok());
    }

    #[test]
    fn only_the_line_terminator_is_stripped() {
        assert_eq!(validate(" V:0.5,0.1"), Err(ProtocolError::MissingTag));
        assert_eq!(validate("\tv:0,0\n"), Err(ProtocolError::MissingTag));
        assert!(validate("V:0.5,0.1\r\n").is_ok());
        assert_eq!(strip_terminator("V:0,0\n\n"), "V:0,0");
    }
}
