//! ControlChannel: commands one way, notifications the other.
//!
//! The same type serves both ends.  On the agent it dispatches viewer
//! commands to an agent-side [`CommandHandler`] and sends notifications; on
//! the viewer it does the reverse.
//!
//! # Read loop
//!
//! [`ControlChannel::run`] keeps a small buffer of received bytes and decodes
//! messages from its front as soon as they are complete.  An
//! incomplete message just means "read more".  Any other decode failure ends
//! the loop with an error: a corrupt control stream cannot be resynchronized,
//! because messages carry no length prefix to skip by.
//!
//! # Writes
//!
//! [`ControlChannel::send`] may be called from any task.  Each message is
//! encoded up front and written with one [`AsyncChannel::write_fully`], which
//! holds the channel's write lock, so messages never interleave.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mirror_core::protocol::encode_control_message;
use mirror_core::{decode_control_message, ControlMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::StreamError;
use crate::infrastructure::channel::{AsyncChannel, ReadOutcome};

/// Messages kept by [`CommandHistory`]; older ones are discarded.
pub const COMMAND_HISTORY_CAPACITY: usize = 1024;

const READ_CHUNK: usize = 4096;

/// Reacts to messages received on a control channel.
#[cfg_attr(test, mockall::automock)]
pub trait CommandHandler: Send + Sync {
    /// Handles one message and optionally returns a reply to send back.
    fn handle(&self, message: &ControlMessage) -> Option<ControlMessage>;
}

/// The most recent messages received on a control channel.
///
/// Tests and diagnostics use it to observe what the peer sent, and to wait
/// until a command has been fully handled.
#[derive(Debug, Default)]
pub struct CommandHistory {
    entries: Mutex<VecDeque<ControlMessage>>,
    appended: Notify,
}

impl CommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, message: ControlMessage) {
        {
            let mut entries = self.lock();
            if entries.len() == COMMAND_HISTORY_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(message);
        }
        self.appended.notify_waiters();
    }

    /// Returns the recorded messages, oldest first.
    pub fn snapshot(&self) -> Vec<ControlMessage> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Waits until a recorded message matches `predicate`, returning it, or
    /// `None` after `timeout`.
    pub async fn wait_for<F>(&self, predicate: F, timeout: Duration) -> Option<ControlMessage>
    where
        F: Fn(&ControlMessage) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let appended = self.appended.notified();
                tokio::pin!(appended);
                // Register before checking so a record() in between is not lost.
                appended.as_mut().enable();
                if let Some(found) = self.lock().iter().find(|m| predicate(m)).cloned() {
                    return found;
                }
                appended.await;
            }
        })
        .await
        .ok()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ControlMessage>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One end of the control channel.
pub struct ControlChannel<S = TcpStream> {
    channel: Arc<AsyncChannel<S>>,
    history: Arc<CommandHistory>,
}

impl<S> Clone for ControlChannel<S> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            history: Arc::clone(&self.history),
        }
    }
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub fn new(channel: Arc<AsyncChannel<S>>) -> Self {
        Self::with_history(channel, Arc::new(CommandHistory::new()))
    }

    /// Creates a control channel that records into an existing history.
    pub fn with_history(channel: Arc<AsyncChannel<S>>, history: Arc<CommandHistory>) -> Self {
        Self { channel, history }
    }

    pub fn history(&self) -> &Arc<CommandHistory> {
        &self.history
    }

    pub fn channel(&self) -> &Arc<AsyncChannel<S>> {
        &self.channel
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// [`StreamError::Protocol`] if the message cannot be encoded (nothing is
    /// written); otherwise as for [`AsyncChannel::write_fully`].
    pub async fn send(&self, message: &ControlMessage) -> Result<(), StreamError> {
        let bytes = encode_control_message(message)?;
        self.channel.write_fully(&bytes).await?;
        trace!(kind = ?message.message_type(), len = bytes.len(), "control message sent");
        Ok(())
    }

    /// Reads and dispatches messages until the peer ends the stream.
    ///
    /// Each message is passed to `handler`, then recorded in the history; a
    /// reply returned by the handler is sent back before the next message is
    /// read.
    ///
    /// # Errors
    ///
    /// [`StreamError::Protocol`] on a decode failure; channel errors as for
    /// [`AsyncChannel::read`].
    pub async fn run<H>(&self, handler: &H) -> Result<(), StreamError>
    where
        H: CommandHandler + ?Sized,
    {
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            loop {
                match decode_control_message(&pending) {
                    Ok((message, consumed)) => {
                        pending.drain(..consumed);
                        self.dispatch(message, handler).await?;
                    }
                    Err(e) if e.is_incomplete() => break,
                    Err(e) => {
                        warn!(channel = self.channel.name(), error = %e, "corrupt control stream");
                        return Err(e.into());
                    }
                }
            }

            match self.channel.read(&mut chunk).await? {
                ReadOutcome::Data(n) => pending.extend_from_slice(&chunk[..n]),
                ReadOutcome::EndOfStream => {
                    if !pending.is_empty() {
                        warn!(discarded = pending.len(), "control stream ended inside a message");
                    }
                    debug!(channel = self.channel.name(), "control stream ended");
                    return Ok(());
                }
            }
        }
    }

    async fn dispatch<H>(&self, message: ControlMessage, handler: &H) -> Result<(), StreamError>
    where
        H: CommandHandler + ?Sized,
    {
        trace!(kind = ?message.message_type(), "control message received");
        let reply = handler.handle(&message);
        self.history.record(message);
        if let Some(reply) = reply {
            self.send(&reply).await?;
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::protocol::messages::{KeyAction, KeyEventMessage};
    use mockall::predicate::eq;
    use tokio::io::{duplex, DuplexStream};
    use tokio_util::sync::CancellationToken;

    fn pair() -> (ControlChannel<DuplexStream>, ControlChannel<DuplexStream>) {
        let scope = CancellationToken::new();
        let (a, b) = duplex(3);
        (
            ControlChannel::new(Arc::new(AsyncChannel::new(a, "control", &scope))),
            ControlChannel::new(Arc::new(AsyncChannel::new(b, "control", &scope))),
        )
    }

    fn key(code: i32) -> ControlMessage {
        ControlMessage::KeyEvent(KeyEventMessage {
            action: KeyAction::DownAndUp,
            key_code: code,
            meta_state: 0,
        })
    }

    #[tokio::test]
    async fn test_commands_are_dispatched_in_order_and_recorded() {
        // Arrange
        let (viewer, agent) = pair();
        let mut handler = MockCommandHandler::new();
        let mut seq = mockall::Sequence::new();
        for code in [4, 5, 6] {
            handler
                .expect_handle()
                .with(eq(key(code)))
                .times(1)
                .in_sequence(&mut seq)
                .return_const(None);
        }

        // Act
        let sender = tokio::spawn(async move {
            for code in [4, 5, 6] {
                viewer.send(&key(code)).await.unwrap();
            }
            viewer.channel().shutdown().await;
        });
        agent.run(&handler).await.expect("clean end of stream");
        sender.await.unwrap();

        // Assert
        assert_eq!(agent.history().snapshot(), vec![key(4), key(5), key(6)]);
    }

    #[tokio::test]
    async fn test_reply_is_sent_back() {
        // Arrange
        let (viewer, agent) = pair();
        let mut handler = MockCommandHandler::new();
        handler
            .expect_handle()
            .returning(|_| Some(ControlMessage::DeviceStateNotification { device_state_id: 2 }));
        let agent_task = tokio::spawn(async move { agent.run(&handler).await });

        // Act
        viewer
            .send(&ControlMessage::RequestDeviceState { device_state_id: 2 })
            .await
            .unwrap();
        let mut notifications = MockCommandHandler::new();
        notifications.expect_handle().return_const(None);
        let viewer_reader = viewer.clone();
        let reader = tokio::spawn(async move { viewer_reader.run(&notifications).await });
        let reply = viewer
            .history()
            .wait_for(|_| true, Duration::from_secs(2))
            .await;

        // Assert
        assert_eq!(reply, Some(ControlMessage::DeviceStateNotification { device_state_id: 2 }));
        viewer.channel().close();
        agent_task.abort();
        let _ = reader.await;
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        // Arrange
        let (viewer, agent) = pair();
        let mut handler = MockCommandHandler::new();
        handler.expect_handle().never();

        // Act: tag 9 is not assigned.
        viewer.channel().write_fully(&[9, 0, 0]).await.unwrap();
        let result = agent.run(&handler).await;

        // Assert
        assert!(matches!(
            result,
            Err(StreamError::Protocol(mirror_core::ProtocolError::UnknownMessageType(9)))
        ));
    }

    #[tokio::test]
    async fn test_oversized_message_is_refused_before_writing() {
        // Arrange
        let (viewer, agent) = pair();
        let oversized = ControlMessage::TextInput {
            text: "x".repeat(mirror_core::protocol::varint::MAX_COLLECTION_LEN + 1),
        };
        let mut handler = MockCommandHandler::new();
        handler
            .expect_handle()
            .with(eq(ControlMessage::StopVideoStream))
            .times(1)
            .returning(|_| None);

        // Act
        let refused = viewer.send(&oversized).await;
        viewer.send(&ControlMessage::StopVideoStream).await.unwrap();
        viewer.channel().shutdown().await;
        let result = agent.run(&handler).await;

        // Assert: the stream stays decodable after the refusal.
        assert!(matches!(
            refused,
            Err(StreamError::Protocol(mirror_core::ProtocolError::PayloadTooLarge { .. }))
        ));
        assert!(result.is_ok());
        assert_eq!(agent.history().snapshot(), [ControlMessage::StopVideoStream]);
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        // Arrange
        let (viewer, agent) = pair();
        let text = |i: usize| ControlMessage::TextInput { text: format!("{i}").repeat(50) };

        // Act
        let senders: Vec<_> = (0..6)
            .map(|i| {
                let viewer = viewer.clone();
                tokio::spawn(async move { viewer.send(&text(i)).await })
            })
            .collect();
        let mut handler = MockCommandHandler::new();
        handler.expect_handle().times(6).return_const(None);
        let reader = tokio::spawn(async move {
            agent.run(&handler).await.map(|()| agent.history().snapshot())
        });
        for s in senders {
            s.await.unwrap().unwrap();
        }
        viewer.channel().shutdown().await;
        let mut received = reader.await.unwrap().unwrap();

        // Assert
        let mut expected: Vec<_> = (0..6).map(text).collect();
        let key = |m: &ControlMessage| format!("{m:?}");
        received.sort_by_key(key);
        expected.sort_by_key(key);
        assert_eq!(received, expected);
    }

    #[test]
    fn test_history_is_bounded() {
        let history = CommandHistory::new();
        for code in 0..(COMMAND_HISTORY_CAPACITY as i32 + 10) {
            history.record(key(code));
        }
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), COMMAND_HISTORY_CAPACITY);
        assert_eq!(snapshot[0], key(10));
    }

    #[tokio::test]
    async fn test_wait_for_times_out_without_match() {
        let history = CommandHistory::new();
        history.record(key(1));
        let found = history
            .wait_for(|m| *m == key(2), Duration::from_millis(20))
            .await;
        assert_eq!(found, None);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_later_record() {
        let history = Arc::new(CommandHistory::new());
        let writer = Arc::clone(&history);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.record(key(7));
        });

        let found = history.wait_for(|m| *m == key(7), Duration::from_secs(2)).await;

        assert_eq!(found, Some(key(7)));
    }

    #[tokio::test]
    async fn test_wait_for_rechecks_after_each_record() {
        // Arrange
        let history = CommandHistory::new();
        let mut waiter = tokio_test::task::spawn(
            history.wait_for(|m| *m == key(3), Duration::from_secs(60)),
        );
        tokio_test::assert_pending!(waiter.poll());

        // Act
        history.record(key(2));
        let woken_by_other = waiter.is_woken();
        tokio_test::assert_pending!(waiter.poll());
        history.record(key(3));

        // Assert
        assert!(woken_by_other);
        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), Some(key(3)));
    }
}
