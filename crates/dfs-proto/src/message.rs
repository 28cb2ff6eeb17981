//! Protocol messages.
//!
//! Every command line is parsed once, at the connection boundary, into a
//! [`Message`]; components then match on it exhaustively. `Display` renders
//! the line without its trailing newline.

use std::fmt;

use crate::constants::*;
use crate::error::{DfsError, DfsResult};
use crate::node::NodeId;
use crate::plan::RebalancePlan;

/// All commands exchanged between clients, the Controller and Dstores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // ---- Membership ----
    /// `JOIN <port>` registers a Dstore; a bare `JOIN` is the Controller's
    /// handshake back to it.
    Join(Option<NodeId>),
    /// `LIST` request (empty) or listing reply.
    List(Vec<String>),

    // ---- Store ----
    Store { filename: String, size: u64 },
    StoreTo(Vec<NodeId>),
    Ack,
    StoreAck { filename: String, node: NodeId },
    StoreComplete,

    // ---- Load ----
    Load { filename: String },
    Reload { filename: String },
    LoadFrom { node: NodeId, size: u64 },
    LoadData { filename: String },

    // ---- Remove ----
    Remove { filename: String },
    RemoveAck { filename: String },
    RemoveComplete,

    // ---- Rebalance ----
    Rebalance(RebalancePlan),
    RebalanceStore { filename: String, size: u64 },
    RebalanceComplete,

    // ---- Errors ----
    ErrorNotEnoughDstores,
    ErrorFileAlreadyExists,
    /// Dstores name the missing file; the Controller's client reply does not.
    ErrorFileDoesNotExist(Option<String>),
    ErrorLoad,
}

impl Message {
    /// Parse one command line (without its newline).
    pub fn parse(line: &str) -> DfsResult<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (&cmd, args) = tokens.split_first().ok_or(DfsError::Protocol)?;

        let msg = match cmd {
            JOIN => match args {
                [] => Message::Join(None),
                [port] => Message::Join(Some(port.parse()?)),
                _ => return Err(DfsError::Protocol),
            },
            LIST => Message::List(filenames(args)?),
            STORE => {
                let (filename, size) = file_and_size(args)?;
                Message::Store { filename, size }
            }
            STORE_TO => Message::StoreTo(
                args.iter()
                    .map(|p| p.parse())
                    .collect::<DfsResult<Vec<NodeId>>>()?,
            ),
            ACK => {
                expect_arity(args, 0)?;
                Message::Ack
            }
            STORE_ACK => match args {
                [filename, port] => Message::StoreAck {
                    filename: owned_filename(filename)?,
                    node: port.parse()?,
                },
                _ => return Err(DfsError::Protocol),
            },
            STORE_COMPLETE => {
                expect_arity(args, 0)?;
                Message::StoreComplete
            }
            LOAD => Message::Load { filename: single_filename(args)? },
            RELOAD => Message::Reload { filename: single_filename(args)? },
            LOAD_FROM => match args {
                [port, size] => Message::LoadFrom {
                    node: port.parse()?,
                    size: parse_size(size)?,
                },
                _ => return Err(DfsError::Protocol),
            },
            LOAD_DATA => Message::LoadData { filename: single_filename(args)? },
            REMOVE => Message::Remove { filename: single_filename(args)? },
            REMOVE_ACK => Message::RemoveAck { filename: single_filename(args)? },
            REMOVE_COMPLETE => {
                expect_arity(args, 0)?;
                Message::RemoveComplete
            }
            REBALANCE => Message::Rebalance(RebalancePlan::parse(args)?),
            REBALANCE_STORE => {
                let (filename, size) = file_and_size(args)?;
                Message::RebalanceStore { filename, size }
            }
            REBALANCE_COMPLETE => {
                expect_arity(args, 0)?;
                Message::RebalanceComplete
            }
            ERROR_NOT_ENOUGH_DSTORES => {
                expect_arity(args, 0)?;
                Message::ErrorNotEnoughDstores
            }
            ERROR_FILE_ALREADY_EXISTS => {
                expect_arity(args, 0)?;
                Message::ErrorFileAlreadyExists
            }
            ERROR_FILE_DOES_NOT_EXIST => match args {
                [] => Message::ErrorFileDoesNotExist(None),
                [filename] => Message::ErrorFileDoesNotExist(Some(owned_filename(filename)?)),
                _ => return Err(DfsError::Protocol),
            },
            ERROR_LOAD => {
                expect_arity(args, 0)?;
                Message::ErrorLoad
            }
            _ => return Err(DfsError::Protocol),
        };
        Ok(msg)
    }

    /// The command token of this message.
    pub fn token(&self) -> &'static str {
        match self {
            Message::Join(_) => JOIN,
            Message::List(_) => LIST,
            Message::Store { .. } => STORE,
            Message::StoreTo(_) => STORE_TO,
            Message::Ack => ACK,
            Message::StoreAck { .. } => STORE_ACK,
            Message::StoreComplete => STORE_COMPLETE,
            Message::Load { .. } => LOAD,
            Message::Reload { .. } => RELOAD,
            Message::LoadFrom { .. } => LOAD_FROM,
            Message::LoadData { .. } => LOAD_DATA,
            Message::Remove { .. } => REMOVE,
            Message::RemoveAck { .. } => REMOVE_ACK,
            Message::RemoveComplete => REMOVE_COMPLETE,
            Message::Rebalance(_) => REBALANCE,
            Message::RebalanceStore { .. } => REBALANCE_STORE,
            Message::RebalanceComplete => REBALANCE_COMPLETE,
            Message::ErrorNotEnoughDstores => ERROR_NOT_ENOUGH_DSTORES,
            Message::ErrorFileAlreadyExists => ERROR_FILE_ALREADY_EXISTS,
            Message::ErrorFileDoesNotExist(_) => ERROR_FILE_DOES_NOT_EXIST,
            Message::ErrorLoad => ERROR_LOAD,
        }
    }

    /// The client-visible error reply for `err`, if it has one.
    pub fn from_error(err: DfsError) -> Option<Self> {
        match err {
            DfsError::NotEnoughDstores => Some(Message::ErrorNotEnoughDstores),
            DfsError::FileAlreadyExists | DfsError::FileTooLarge => {
                Some(Message::ErrorFileAlreadyExists)
            }
            DfsError::FileDoesNotExist => Some(Message::ErrorFileDoesNotExist(None)),
            DfsError::LoadExhausted => Some(Message::ErrorLoad),
            _ => None,
        }
    }

    /// The error this message signals, if it is an error token.
    pub fn as_error(&self) -> Option<DfsError> {
        match self {
            Message::ErrorNotEnoughDstores => Some(DfsError::NotEnoughDstores),
            Message::ErrorFileAlreadyExists => Some(DfsError::FileAlreadyExists),
            Message::ErrorFileDoesNotExist(_) => Some(DfsError::FileDoesNotExist),
            Message::ErrorLoad => Some(DfsError::LoadExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())?;
        match self {
            Message::Join(Some(node)) => write!(f, " {}", node),
            Message::List(files) => write_all(f, files),
            Message::Store { filename, size } | Message::RebalanceStore { filename, size } => {
                write!(f, " {} {}", filename, size)
            }
            Message::StoreTo(nodes) => write_all(f, nodes),
            Message::StoreAck { filename, node } => write!(f, " {} {}", filename, node),
            Message::Load { filename }
            | Message::Reload { filename }
            | Message::LoadData { filename }
            | Message::Remove { filename }
            | Message::RemoveAck { filename }
            | Message::ErrorFileDoesNotExist(Some(filename)) => write!(f, " {}", filename),
            Message::LoadFrom { node, size } => write!(f, " {} {}", node, size),
            Message::Rebalance(plan) => write!(f, " {}", plan),
            _ => Ok(()),
        }
    }
}

fn write_all<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for item in items {
        write!(f, " {}", item)?;
    }
    Ok(())
}

/// Reject filenames the line protocol cannot carry.
pub fn validate_filename(name: &str) -> DfsResult<()> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(DfsError::Protocol);
    }
    Ok(())
}

fn owned_filename(name: &str) -> DfsResult<String> {
    validate_filename(name)?;
    Ok(name.to_string())
}

fn filenames(args: &[&str]) -> DfsResult<Vec<String>> {
    args.iter().map(|a| owned_filename(a)).collect()
}

fn single_filename(args: &[&str]) -> DfsResult<String> {
    match args {
        [filename] => owned_filename(filename),
        _ => Err(DfsError::Protocol),
    }
}

fn file_and_size(args: &[&str]) -> DfsResult<(String, u64)> {
    match args {
        [filename, size] => Ok((owned_filename(filename)?, parse_size(size)?)),
        _ => Err(DfsError::Protocol),
    }
}

fn parse_size(s: &str) -> DfsResult<u64> {
    s.parse::<u64>().map_err(|_| DfsError::Protocol)
}

fn expect_arity(args: &[&str], n: usize) -> DfsResult<()> {
    if args.len() == n {
        Ok(())
    } else {
        Err(DfsError::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_join_forms() {
        assert_eq!(Message::parse("JOIN 8001").unwrap(), Message::Join(Some(NodeId(8001))));
        assert_eq!(Message::parse("JOIN").unwrap(), Message::Join(None));
        assert_eq!(Message::parse("JOIN abc"), Err(DfsError::Protocol));
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(Message::parse("LIST").unwrap(), Message::List(vec![]));
        assert_eq!(
            Message::parse("LIST a b").unwrap(),
            Message::List(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn test_parse_store_family() {
        assert_eq!(
            Message::parse("STORE fileA 10").unwrap(),
            Message::Store { filename: "fileA".into(), size: 10 }
        );
        assert_eq!(
            Message::parse("STORE_TO 8001 8002 8003").unwrap(),
            Message::StoreTo(vec![NodeId(8001), NodeId(8002), NodeId(8003)])
        );
        assert_eq!(
            Message::parse("STORE_ACK fileA 8002").unwrap(),
            Message::StoreAck { filename: "fileA".into(), node: NodeId(8002) }
        );
        assert_eq!(Message::parse("STORE fileA"), Err(DfsError::Protocol));
        assert_eq!(Message::parse("STORE fileA -1"), Err(DfsError::Protocol));
    }

    #[test]
    fn test_parse_tolerates_whitespace() {
        assert_eq!(
            Message::parse("  LOAD   fileA \r").unwrap(),
            Message::Load { filename: "fileA".into() }
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_empty() {
        assert_eq!(Message::parse(""), Err(DfsError::Protocol));
        assert_eq!(Message::parse("FROB x"), Err(DfsError::Protocol));
        assert_eq!(Message::parse("ACK extra"), Err(DfsError::Protocol));
        assert_eq!(Message::parse("store fileA 1"), Err(DfsError::Protocol));
    }

    #[test]
    fn test_parse_error_tokens() {
        assert_eq!(
            Message::parse("ERROR_FILE_DOES_NOT_EXIST fileA").unwrap(),
            Message::ErrorFileDoesNotExist(Some("fileA".into()))
        );
        assert_eq!(
            Message::parse("ERROR_FILE_DOES_NOT_EXIST").unwrap().as_error(),
            Some(DfsError::FileDoesNotExist)
        );
        assert_eq!(Message::parse("ERROR_LOAD").unwrap().as_error(), Some(DfsError::LoadExhausted));
    }

    #[test]
    fn test_parse_rebalance() {
        let msg = Message::parse("REBALANCE 1 fileA 1 8004 1 fileB").unwrap();
        match msg {
            Message::Rebalance(plan) => {
                assert_eq!(plan.sends["fileA"], vec![NodeId(8004)]);
                assert!(plan.removes.contains("fileB"));
            }
            other => panic!("expected Rebalance, got {:?}", other),
        }
    }

    #[test]
    fn test_display_lines() {
        assert_eq!(Message::Join(Some(NodeId(8001))).to_string(), "JOIN 8001");
        assert_eq!(Message::List(vec![]).to_string(), "LIST");
        assert_eq!(
            Message::LoadFrom { node: NodeId(8002), size: 42 }.to_string(),
            "LOAD_FROM 8002 42"
        );
        assert_eq!(
            Message::RemoveAck { filename: "f".into() }.to_string(),
            "REMOVE_ACK f"
        );
        assert_eq!(Message::ErrorFileDoesNotExist(None).to_string(), "ERROR_FILE_DOES_NOT_EXIST");

        let mut plan = RebalancePlan::new();
        plan.push("f", NodeId(9));
        assert_eq!(Message::Rebalance(plan).to_string(), "REBALANCE 1 f 1 9 0");
    }

    #[test]
    fn test_error_reply_mapping() {
        assert_eq!(
            Message::from_error(DfsError::FileTooLarge),
            Some(Message::ErrorFileAlreadyExists)
        );
        assert_eq!(Message::from_error(DfsError::Timeout), None);
        assert_eq!(DfsError::FileTooLarge.reply(), Some(ERROR_FILE_ALREADY_EXISTS));
    }
}
