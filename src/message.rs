//! Wire protocol between cluster members.
//!
//! [`Message`] is the complete replication vocabulary: vote traffic,
//! `AppendEntries` (which doubles as the heartbeat when it carries no
//! entries), and the commit probe a follower sends the leader to bound a
//! majority read. Frames on the wire are a 4-byte big-endian length prefix
//! followed by the bincode payload.

use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::log::LogEntry;
use crate::types::{LogIndex, NodeId, Role, Term};

/// Upper bound on a single frame. A well-formed peer never comes close; a
/// corrupt length prefix must not turn into an unbounded allocation.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Everything one member can say to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A candidate asks for a vote in `term`. The last-log fields let the
    /// receiver refuse candidates whose log is behind its own.
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: LogIndex,
        last_log_term: Term,
    },
    VoteResponse {
        term: Term,
        from: NodeId,
        granted: bool,
    },
    /// Log replication and heartbeat. `entries` is empty for a pure
    /// heartbeat; `leader_commit` carries the leader's watermark so
    /// followers can apply.
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: LogIndex,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    },
    /// `match_index` is the highest index the follower now holds when
    /// `success`, and meaningless otherwise.
    AppendResponse {
        term: Term,
        from: NodeId,
        success: bool,
        match_index: LogIndex,
    },
    /// A follower asks the leader for its commit watermark to bound a
    /// majority read.
    CommitQuery { term: Term, from: NodeId },
    CommitInfo {
        term: Term,
        from: NodeId,
        commit_index: LogIndex,
    },
}

impl Message {
    /// The member that sent this message.
    pub fn sender(&self) -> NodeId {
        match self {
            Message::VoteRequest { candidate_id, .. } => *candidate_id,
            Message::VoteResponse { from, .. } => *from,
            Message::AppendEntries { leader_id, .. } => *leader_id,
            Message::AppendResponse { from, .. } => *from,
            Message::CommitQuery { from, .. } => *from,
            Message::CommitInfo { from, .. } => *from,
        }
    }

    /// The sender's term at send time.
    pub fn term(&self) -> Term {
        match self {
            Message::VoteRequest { term, .. }
            | Message::VoteResponse { term, .. }
            | Message::AppendEntries { term, .. }
            | Message::AppendResponse { term, .. }
            | Message::CommitQuery { term, .. }
            | Message::CommitInfo { term, .. } => *term,
        }
    }

    /// What this message implies about the sender's role, for membership
    /// bookkeeping. Responses and probes default to follower, the common
    /// case.
    pub fn role_hint(&self) -> Role {
        match self {
            Message::VoteRequest { .. } => Role::Candidate,
            Message::AppendEntries { .. } | Message::CommitInfo { .. } => Role::Leader,
            _ => Role::Follower,
        }
    }
}

/// Reads one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closed the connection before sending a
/// length prefix. A frame cut off mid-payload is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let parsed = bincode::deserialize(&payload).map_err(to_io_error)?;
    Ok(Some(parsed))
}

/// Writes one length-prefixed frame and flushes it.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message).map_err(to_io_error)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("refusing to send a {} byte frame", payload.len()),
        ));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: bincode::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_and_term_cover_every_variant() {
        let entries = vec![LogEntry {
            index: 4,
            term: 2,
            key: "k".to_string(),
            value: "v".to_string(),
            causal_token: Some(3),
        }];
        let msg = Message::AppendEntries {
            term: 2,
            leader_id: 7,
            prev_log_index: 3,
            prev_log_term: 2,
            entries,
            leader_commit: 3,
        };
        assert_eq!(msg.sender(), 7);
        assert_eq!(msg.term(), 2);
        assert_eq!(msg.role_hint(), Role::Leader);

        let msg = Message::VoteRequest {
            term: 5,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        };
        assert_eq!(msg.sender(), 2);
        assert_eq!(msg.role_hint(), Role::Candidate);
    }

    #[tokio::test]
    async fn roundtrip_append_entries() {
        let (mut writer, mut reader) = tokio::io::duplex(1024);
        let message = Message::AppendEntries {
            term: 3,
            leader_id: 1,
            prev_log_index: 2,
            prev_log_term: 2,
            entries: vec![LogEntry {
                index: 3,
                term: 3,
                key: "color".to_string(),
                value: "teal".to_string(),
                causal_token: None,
            }],
            leader_commit: 2,
        };

        write_frame(&mut writer, &message).await.expect("write frame");
        let parsed = read_frame::<_, Message>(&mut reader)
            .await
            .expect("read frame")
            .expect("expected a frame");

        assert_eq!(message, parsed);
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (writer, mut reader) = tokio::io::duplex(64);
        drop(writer);
        let parsed = read_frame::<_, Message>(&mut reader).await.expect("read");
        assert!(parsed.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_u32(u32::MAX).await.expect("write len");
        let err = read_frame::<_, Message>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        writer.write_u32(32).await.expect("write len");
        writer.write_all(&[0u8; 4]).await.expect("write partial");
        drop(writer);
        let err = read_frame::<_, Message>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
