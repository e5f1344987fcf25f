//! Console command grammar.
//!
//! Commands are case-insensitive and whitespace-separated. `PUT` takes an
//! optional write concern and `GET` an optional read concern and read
//! preference; omitted knobs fall back to the defaults (majority writes,
//! local any-replica reads).

use anyhow::{bail, Result};

use crate::types::{ReadConcern, ReadPreference, WriteConcern};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Put {
        key: String,
        value: String,
        concern: WriteConcern,
    },
    Get {
        key: String,
        concern: ReadConcern,
        preference: ReadPreference,
    },
    Status,
    Campaign,
    Exit,
    Help,
}

/// Parses one console line.
pub fn parse(line: &str) -> Result<ConsoleCommand> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = parts.split_first() else {
        bail!("empty command");
    };
    match cmd.to_ascii_uppercase().as_str() {
        "PUT" | "P" => match args {
            [key, value] => Ok(ConsoleCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
                concern: WriteConcern::default(),
            }),
            [key, value, concern] => Ok(ConsoleCommand::Put {
                key: key.to_string(),
                value: value.to_string(),
                concern: parse_write_concern(concern)?,
            }),
            _ => bail!("usage: PUT <key> <value> [one|majority|all]"),
        },
        "GET" | "G" => match args {
            [key] => Ok(ConsoleCommand::Get {
                key: key.to_string(),
                concern: ReadConcern::default(),
                preference: ReadPreference::default(),
            }),
            [key, concern] => Ok(ConsoleCommand::Get {
                key: key.to_string(),
                concern: parse_read_concern(concern)?,
                preference: ReadPreference::default(),
            }),
            [key, concern, preference] => Ok(ConsoleCommand::Get {
                key: key.to_string(),
                concern: parse_read_concern(concern)?,
                preference: parse_read_preference(preference)?,
            }),
            _ => bail!("usage: GET <key> [local|majority] [leader|any]"),
        },
        "STATUS" | "S" => Ok(ConsoleCommand::Status),
        "CAMPAIGN" | "C" => Ok(ConsoleCommand::Campaign),
        "EXIT" | "QUIT" | "E" | "Q" => Ok(ConsoleCommand::Exit),
        "HELP" | "H" | "?" => Ok(ConsoleCommand::Help),
        other => bail!("unknown command: {other} (try HELP)"),
    }
}

fn parse_write_concern(s: &str) -> Result<WriteConcern> {
    match s.to_ascii_lowercase().as_str() {
        "one" | "1" => Ok(WriteConcern::One),
        "majority" | "maj" => Ok(WriteConcern::Majority),
        "all" => Ok(WriteConcern::All),
        other => bail!("unknown write concern: {other} (one, majority, all)"),
    }
}

fn parse_read_concern(s: &str) -> Result<ReadConcern> {
    match s.to_ascii_lowercase().as_str() {
        "local" => Ok(ReadConcern::Local),
        "majority" | "maj" => Ok(ReadConcern::Majority),
        other => bail!("unknown read concern: {other} (local, majority)"),
    }
}

fn parse_read_preference(s: &str) -> Result<ReadPreference> {
    match s.to_ascii_lowercase().as_str() {
        "leader" => Ok(ReadPreference::Leader),
        "any" | "anyreplica" => Ok(ReadPreference::AnyReplica),
        other => bail!("unknown read preference: {other} (leader, any)"),
    }
}
