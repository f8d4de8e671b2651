//! Output relay: one reader task per managed process.
//!
//! The relay merges a child's stdout and stderr into one line stream,
//! decodes each line and forwards it to the console channel. It ends when
//! both pipes close and is never restarted; a respawned process gets a new
//! relay.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{Event, OutputLine};
use crate::output::{decode_line, StreamKind};

/// Attaches a relay to a child's output pipes.
///
/// Either pipe may be absent (e.g. already taken); the relay then reads the
/// other one alone.
pub fn attach<O, E>(
    name: &str,
    tag: Option<String>,
    stdout: Option<O>,
    stderr: Option<E>,
    tx: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        relay(name, tag, stdout, stderr, tx).await;
    })
}

async fn relay<O, E>(
    name: String,
    tag: Option<String>,
    stdout: Option<O>,
    stderr: Option<E>,
    tx: mpsc::UnboundedSender<Event>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(|r| BufReader::new(r).split(b'\n'));
    let mut err = stderr.map(|r| BufReader::new(r).split(b'\n'));

    while out.is_some() || err.is_some() {
        // `next_segment` is cancel safe, so losing the race drops no bytes.
        let (segment, stream) = tokio::select! {
            res = next(&mut out), if out.is_some() => (res, StreamKind::Stdout),
            res = next(&mut err), if err.is_some() => (res, StreamKind::Stderr),
        };
        let raw = match segment {
            Ok(Some(raw)) => raw,
            Ok(None) | Err(_) => {
                match stream {
                    StreamKind::Stdout => out = None,
                    StreamKind::Stderr => err = None,
                }
                continue;
            }
        };
        let line = OutputLine {
            process: name.clone(),
            tag: tag.clone(),
            text: decode_line(&raw),
            stream,
        };
        if tx.send(Event::Output(line)).is_err() {
            break;
        }
    }
    tracing::trace!(process = %name, "relay reached end of output");
}

async fn next<R>(
    split: &mut Option<tokio::io::Split<BufReader<R>>>,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    match split {
        Some(split) => split.next_segment().await,
        None => Ok(None),
    }
}
