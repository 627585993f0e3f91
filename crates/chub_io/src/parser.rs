//! Parsers for the debug command surface.
//!
//! Commands arrive as text, the way they would be written to a control
//! file: a command name such as `aging` or its numeric code such as `1`,
//! surrounded by optional blanks and a trailing newline. Payloads for the
//! data channel are written as hex bytes, optionally separated by blanks.

use anyhow::{Result, anyhow};
use chub_common::debug::DebugCommand;
use nom::IResult;
use nom::branch::alt;
use nom::bytes::complete::{take_while_m_n, take_while1};
use nom::character::complete::{digit1, line_ending, space0};
use nom::combinator::{all_consuming, map_opt, map_res, opt};
use nom::multi::many1;
use nom::sequence::{delimited, terminated, tuple};

fn command_code(input: &str) -> IResult<&str, DebugCommand> {
    map_opt(map_res(digit1, str::parse::<u32>), DebugCommand::from_code)(input)
}

fn command_name(input: &str) -> IResult<&str, DebugCommand> {
    map_opt(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        DebugCommand::from_name,
    )(input)
}

fn command(input: &str) -> IResult<&str, DebugCommand> {
    all_consuming(delimited(
        space0,
        alt((command_code, command_name)),
        tuple((space0, opt(line_ending))),
    ))(input)
}

/// Parses a debug command by name or numeric code.
pub fn parse_command(input: &str) -> Result<DebugCommand> {
    command(input)
        .map(|(_, cmd)| cmd)
        .map_err(|err| anyhow!("invalid debug command {:?}: {}", input, err))
}

fn hex_byte(input: &str) -> IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |digits| {
        u8::from_str_radix(digits, 16)
    })(input)
}

fn payload(input: &str) -> IResult<&str, Vec<u8>> {
    all_consuming(delimited(
        space0,
        many1(terminated(hex_byte, space0)),
        opt(line_ending),
    ))(input)
}

/// Parses hex bytes such as `de ad be ef` or `deadbeef`.
pub fn parse_payload(input: &str) -> Result<Vec<u8>> {
    payload(input)
        .map(|(_, bytes)| bytes)
        .map_err(|err| anyhow!("invalid payload {:?}: {}", input, err))
}
