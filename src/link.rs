//! The [`Link`] facade: one serial link to a coordinator.
//!
//! A link owns two background tasks. The reader task decodes incoming bytes
//! and routes each message to a waiting caller and/or the callback queue;
//! the dispatcher task runs callbacks. Callers share the link through `&self`
//! (wrap it in an `Arc` to use it from several tasks).
//!
//! Both tasks watch a `bool` stop signal. Writes are bounded by a timeout and
//! raced against the same signal, so no caller blocks on a stalled device.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::correlation::{DEFAULT_WAIT_SLOTS, Delivery, PendingWait, WaitRegistry, WaitTarget};
use crate::error::{Error, Result};
use crate::event::{
    CallbackRegistry, CallbackTask, DEFAULT_CALLBACK_QUEUE, DEFAULT_DISPATCH_POLL,
    DEFAULT_ENQUEUE_TIMEOUT, Dispatcher, Handler, HandlerId, run_dispatcher, stopped,
};
use crate::protocol::{Decoded, FrameDecoder, LOG, encode_frame};
use crate::transport::{SerialConfig, SerialTransport, Transport};
use crate::types::{Acknowledgment, LinkStats, LinkStatsSnapshot, LogRecord, Message};

/// Default time to wait for a command acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Default pause before retrying a failed hand-off to a waiter.
pub const DEFAULT_DELIVERY_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Default bound on writing one frame with [`Link::send`].
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 1024;

/// Tuning for a link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Number of concurrent waits.
    pub wait_slots: usize,
    /// Callback queue capacity.
    pub callback_queue: usize,
    /// Timeout used by [`Link::send_and_ack`].
    pub ack_timeout: Duration,
    /// Bound on a plain send and on closing the stream.
    pub write_timeout: Duration,
    /// How often the dispatcher wakes on an empty queue.
    pub dispatch_poll: Duration,
    /// How long the reader waits for room in a full callback queue.
    pub enqueue_timeout: Duration,
    /// Pause before retrying a failed hand-off to a waiter.
    pub delivery_retry_delay: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            wait_slots: DEFAULT_WAIT_SLOTS,
            callback_queue: DEFAULT_CALLBACK_QUEUE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            dispatch_poll: DEFAULT_DISPATCH_POLL,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            delivery_retry_delay: DEFAULT_DELIVERY_RETRY_DELAY,
        }
    }
}

impl LinkConfig {
    /// Sets the number of wait slots.
    #[must_use]
    pub const fn wait_slots(mut self, slots: usize) -> Self {
        self.wait_slots = slots;
        self
    }

    /// Sets the callback queue capacity.
    #[must_use]
    pub const fn callback_queue(mut self, capacity: usize) -> Self {
        self.callback_queue = capacity;
        self
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the dispatcher poll interval.
    #[must_use]
    pub const fn dispatch_poll(mut self, poll: Duration) -> Self {
        self.dispatch_poll = poll;
        self
    }

    /// Sets the callback enqueue timeout.
    #[must_use]
    pub const fn enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    /// Sets the delivery retry delay.
    #[must_use]
    pub const fn delivery_retry_delay(mut self, delay: Duration) -> Self {
        self.delivery_retry_delay = delay;
        self
    }
}

/// Lifecycle state of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Reader and dispatcher are running.
    Running,
    /// Stopped by [`Link::stop`].
    Stopped,
    /// The transport failed.
    Failed(String),
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of the stream; `None` once released. Holding the lock is the send lock.
type SharedWriter = Arc<AsyncMutex<Option<Writer>>>;

/// A running serial link to a coordinator.
pub struct Link {
    writer: SharedWriter,
    waits: WaitRegistry,
    callbacks: Arc<CallbackRegistry>,
    stats: Arc<LinkStats>,
    state: Arc<watch::Sender<LinkState>>,
    stop: watch::Sender<bool>,
    config: LinkConfig,

    // Background tasks
    reader_task: Mutex<Option<JoinHandle<()>>>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Starts a link over an open byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<S>(stream: S, config: LinkConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(AsyncMutex::new(Some(Box::new(write_half))));

        let (stop, _) = watch::channel(false);
        let waits = WaitRegistry::new(config.wait_slots);
        let callbacks = Arc::new(CallbackRegistry::new());
        let stats = Arc::new(LinkStats::default());
        let (state, _) = watch::channel(LinkState::Running);
        let state = Arc::new(state);

        let (dispatcher, queue) = Dispatcher::new(config.callback_queue, config.enqueue_timeout);
        let dispatch_task = tokio::spawn(run_dispatcher(
            queue,
            stop.subscribe(),
            config.dispatch_poll,
        ));

        let reader = Reader {
            decoder: FrameDecoder::new(),
            waits: waits.clone(),
            callbacks: Arc::clone(&callbacks),
            dispatcher,
            stats: Arc::clone(&stats),
            state: Arc::clone(&state),
            writer: Arc::clone(&writer),
            retry_delay: config.delivery_retry_delay,
        };
        let reader_task = tokio::spawn(reader.run(read_half, stop.subscribe()));

        tracing::debug!("link started");

        Self {
            writer,
            waits,
            callbacks,
            stats,
            state,
            stop,
            config,
            reader_task: Mutex::new(Some(reader_task)),
            dispatch_task: Mutex::new(Some(dispatch_task)),
        }
    }

    /// Opens `transport` and starts a link over it.
    pub async fn open<T: Transport>(transport: &mut T, config: LinkConfig) -> Result<Self> {
        let stream = transport.open().await?;
        tracing::info!("link open on {}", transport.name());
        Ok(Self::start(stream, config))
    }

    /// Opens a serial device and starts a link over it.
    pub async fn serial(serial: SerialConfig, config: LinkConfig) -> Result<Self> {
        let mut transport = SerialTransport::new(serial);
        Self::open(&mut transport, config).await
    }

    /// Sends a message without waiting for any response.
    ///
    /// Waiting for the send lock and writing the frame together take at most
    /// the configured write timeout.
    pub async fn send(&self, msg_type: u16, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(msg_type, payload)?;
        let timeout = self.config.write_timeout;
        let deadline = Instant::now() + timeout;

        let mut writer = self.lock_writer(deadline, timeout).await?;
        self.write_frame(&mut writer, msg_type, payload, &frame, deadline, timeout)
            .await
    }

    /// Sends a command and waits for its acknowledgement.
    ///
    /// `timeout` bounds the whole exchange: waiting for the send lock, writing
    /// the frame and waiting for the acknowledgement. The send lock is held
    /// until the acknowledgement arrives or the wait fails, so only one
    /// acknowledged command is on the wire at a time. A non-zero status is
    /// returned as [`Error::Status`].
    pub async fn send_and_await_ack(
        &self,
        msg_type: u16,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Acknowledgment> {
        let frame = encode_frame(msg_type, payload)?;
        let deadline = Instant::now() + timeout;
        let mut writer = self.lock_writer(deadline, timeout).await?;

        let pending = self.waits.claim(WaitTarget::acknowledgement(msg_type))?;
        self.write_frame(&mut writer, msg_type, payload, &frame, deadline, timeout)
            .await?;
        let reply = pending
            .wait(deadline.saturating_duration_since(Instant::now()))
            .await;
        drop(writer);

        let reply = match reply {
            Err(Error::Timeout { .. }) => return Err(Error::timeout(timeout)),
            reply => reply?,
        };
        let ack = Acknowledgment::parse(&reply.payload)?;
        tracing::debug!(
            "status {} (sequence {}) for 0x{msg_type:04x}",
            ack.status,
            ack.sequence
        );
        ack.into_result()
    }

    /// Sends a command and waits for its acknowledgement using the configured timeout.
    pub async fn send_and_ack(&self, msg_type: u16, payload: &[u8]) -> Result<Acknowledgment> {
        self.send_and_await_ack(msg_type, payload, self.config.ack_timeout)
            .await
    }

    /// Sends a command, waits for its acknowledgement, then for a response of `response_type`.
    ///
    /// The response wait is claimed before the command is sent.
    pub async fn request(
        &self,
        msg_type: u16,
        payload: &[u8],
        response_type: u16,
        timeout: Duration,
    ) -> Result<Message> {
        let response = self.waits.claim(WaitTarget::message(response_type))?;
        let start = Instant::now();
        self.send_and_await_ack(msg_type, payload, timeout).await?;
        response.wait(timeout.saturating_sub(start.elapsed())).await
    }

    /// Waits for the next message of `msg_type`.
    pub async fn await_message(&self, msg_type: u16, timeout: Duration) -> Result<Message> {
        self.waits
            .await_message(WaitTarget::message(msg_type), timeout)
            .await
    }

    /// Claims a wait slot without waiting yet.
    pub fn claim(&self, target: WaitTarget) -> Result<PendingWait> {
        self.waits.claim(target)
    }

    /// Registers the callback for `msg_type`.
    pub fn register(&self, msg_type: u16, handler: impl Handler) -> Result<HandlerId> {
        self.callbacks.register(msg_type, handler)
    }

    /// Removes the callback for `msg_type`.
    pub fn unregister(&self, msg_type: u16, id: HandlerId) -> Result<()> {
        self.callbacks.unregister(msg_type, id)
    }

    /// Returns the link counters.
    #[must_use]
    pub fn stats(&self) -> LinkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    /// Subscribes to state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Stops the reader and dispatcher, releases every waiter and closes the stream.
    pub async fn stop(&self) {
        self.stop.send_replace(true);

        let tasks = [
            take_task(&self.reader_task),
            take_task(&self.dispatch_task),
        ];
        for task in tasks.into_iter().flatten() {
            if let Err(e) = task.await {
                tracing::error!("link task failed: {}", e);
            }
        }

        self.waits.close();
        self.callbacks.clear();

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(self.config.write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("closing stream failed: {}", e),
                Err(_) => tracing::debug!("closing stream timed out"),
            }
        }

        self.state.send_if_modified(|state| {
            if *state == LinkState::Running {
                *state = LinkState::Stopped;
                true
            } else {
                false
            }
        });
        tracing::debug!("link stopped");
    }

    async fn lock_writer(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<AsyncMutexGuard<'_, Option<Writer>>> {
        tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| Error::timeout(timeout))
    }

    async fn write_frame(
        &self,
        writer: &mut Option<Writer>,
        msg_type: u16,
        payload: &[u8],
        frame: &[u8],
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        if *self.state.borrow() != LinkState::Running {
            return Err(Error::NotConnected);
        }
        let Some(stream) = writer.as_mut() else {
            return Err(Error::NotConnected);
        };

        tracing::trace!(
            "host->node 0x{msg_type:04x} ({} bytes) {}",
            payload.len(),
            hex::encode(payload)
        );

        let mut stop = self.stop.subscribe();
        let written = tokio::select! {
            biased;
            () = stopped(&mut stop) => return Err(Error::LinkClosed),
            written = tokio::time::timeout_at(deadline, async {
                stream.write_all(frame).await?;
                stream.flush().await
            }) => written,
        };

        let (reason, err) = match written {
            Ok(Ok(())) => {
                self.stats.frame_sent();
                return Ok(());
            }
            Ok(Err(e)) => {
                tracing::error!("serial write error: {}", e);
                (e.to_string(), Error::Io(e))
            }
            Err(_) => {
                tracing::error!("write of 0x{msg_type:04x} stalled for {:?}", timeout);
                ("write timed out".to_string(), Error::timeout(timeout))
            }
        };

        // Part of the frame may be on the wire; the stream is unusable
        *writer = None;
        self.state.send_replace(LinkState::Failed(reason));
        self.stop.send_replace(true);
        Err(err)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

fn take_task(task: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    task.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// State owned by the reader task.
struct Reader {
    decoder: FrameDecoder,
    waits: WaitRegistry,
    callbacks: Arc<CallbackRegistry>,
    dispatcher: Dispatcher,
    stats: Arc<LinkStats>,
    state: Arc<watch::Sender<LinkState>>,
    writer: SharedWriter,
    retry_delay: Duration,
}

impl Reader {
    async fn run<R>(mut self, mut reader: R, mut stop: watch::Receiver<bool>)
    where
        R: AsyncRead + Unpin,
    {
        tracing::debug!("reader started");
        let mut buf = [0u8; READ_BUFFER_SIZE];

        let failure = loop {
            let n = tokio::select! {
                biased;
                () = stopped(&mut stop) => break None,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => break Some("serial port closed".to_string()),
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!("serial read error: {}", e);
                        break Some(e.to_string());
                    }
                },
            };

            tracing::trace!("received {} bytes", n);
            for &byte in &buf[..n] {
                match self.decoder.push(byte) {
                    Decoded::Pending => {}
                    Decoded::Message(message) => self.route(message).await,
                    Decoded::Rejected(e) => {
                        tracing::debug!("dropped frame: {}", e);
                        self.stats.frame_rejected();
                    }
                }
            }
        };

        self.waits.close();
        if let Some(reason) = failure {
            tracing::warn!("link failed: {}", reason);
            self.state.send_replace(LinkState::Failed(reason));
            // Waiters are released, so an acknowledged send gives up the lock
            drop(self.writer.lock().await.take());
        }
        tracing::debug!("reader stopped");
    }

    async fn route(&self, message: Message) {
        self.stats.frame_received();
        tracing::trace!(
            "node->host 0x{:04x} ({} bytes) {}",
            message.msg_type,
            message.payload.len(),
            hex::encode(&message.payload)
        );

        if message.msg_type == LOG {
            log_record(&message);
            return;
        }

        let mut handled = self.deliver(&message).await;

        if let Some(handler) = self.callbacks.lookup(message.msg_type) {
            let msg_type = message.msg_type;
            if self
                .dispatcher
                .enqueue(CallbackTask::new(message, handler))
                .await
            {
                self.stats.callback_queued();
                handled = true;
            } else {
                tracing::warn!("callback for 0x{msg_type:04x} dropped");
                self.stats.callback_dropped();
            }
        } else if !handled {
            tracing::debug!("message 0x{:04x} was not handled", message.msg_type);
            self.stats.unhandled();
        }
    }

    async fn deliver(&self, message: &Message) -> bool {
        for attempt in 0..2 {
            match self.waits.deliver(message) {
                Delivery::Delivered { .. } => {
                    self.stats.delivered();
                    return true;
                }
                Delivery::NoWaiter => return false,
                Delivery::Failed => {
                    tracing::debug!(
                        "handing 0x{:04x} to a waiter failed (attempt {})",
                        message.msg_type,
                        attempt + 1
                    );
                    if attempt == 0 {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        false
    }
}

/// Re-emits a coordinator log line through tracing.
fn log_record(message: &Message) {
    match LogRecord::parse(&message.payload) {
        Ok(record) => match record.level {
            0..=3 => tracing::error!(target: "coordinator", "{}", record.text),
            4 => tracing::warn!(target: "coordinator", "{}", record.text),
            5 | 6 => tracing::info!(target: "coordinator", "{}", record.text),
            _ => tracing::debug!(target: "coordinator", "{}", record.text),
        },
        Err(e) => tracing::debug!("bad log record: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    use crate::error::FrameError;
    use crate::protocol::{MAX_PAYLOAD_SIZE, MessageType, STATUS};

    const ANNOUNCE: u16 = MessageType::DeviceAnnounce.as_u16();
    const REPORT: u16 = MessageType::AttributeReport.as_u16();

    /// The coordinator end of an in-memory link.
    struct Coordinator {
        stream: DuplexStream,
        decoder: FrameDecoder,
    }

    impl Coordinator {
        async fn read_message(&mut self) -> Message {
            let mut byte = [0u8; 1];
            loop {
                self.stream.read_exact(&mut byte).await.unwrap();
                if let Decoded::Message(message) = self.decoder.push(byte[0]) {
                    return message;
                }
            }
        }

        async fn write_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        async fn write_message(&mut self, msg_type: u16, payload: &[u8]) {
            let frame = encode_frame(msg_type, payload).unwrap();
            self.write_raw(&frame).await;
        }

        async fn acknowledge(&mut self, status: u8, sequence: u8, original_type: u16) {
            let ack = ack_payload(status, sequence, original_type);
            self.write_message(STATUS, &ack).await;
        }
    }

    fn ack_payload(status: u8, sequence: u8, original_type: u16) -> Bytes {
        Acknowledgment {
            status,
            sequence,
            original_type,
            detail: None,
        }
        .to_payload()
    }

    fn connect(config: LinkConfig) -> (Link, Coordinator) {
        connect_with_buffer(config, 4096)
    }

    fn connect_with_buffer(config: LinkConfig, max_buf_size: usize) -> (Link, Coordinator) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("zcb_link=trace,coordinator=debug")
            .with_test_writer()
            .try_init();

        let (host, device) = tokio::io::duplex(max_buf_size);
        let link = Link::start(host, config);
        let coordinator = Coordinator {
            stream: device,
            decoder: FrameDecoder::new(),
        };
        (link, coordinator)
    }

    async fn wait_for_state(link: &Link, wanted: fn(&LinkState) -> bool) {
        let mut changes = link.state_changes();
        tokio::time::timeout(Duration::from_secs(5), changes.wait_for(|state| wanted(state)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_writes_encoded_frame() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        link.send(0x0005, &[0x00, 0x01, 0x02]).await.unwrap();

        let mut raw = [0u8; 18];
        coordinator.stream.read_exact(&mut raw).await.unwrap();
        assert_eq!(
            raw,
            [
                0x01, 0x02, 0x10, 0x02, 0x15, 0x02, 0x10, 0x02, 0x13, 0x02, 0x15, 0x02, 0x10,
                0x02, 0x11, 0x02, 0x12, 0x03
            ]
        );
        assert_eq!(link.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_send_rejects_oversize_payload() {
        let (link, _coordinator) = connect(LinkConfig::default());
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = link.send(0x0100, &payload).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Frame(FrameError::PayloadTooLarge { .. })
        ));
        assert_eq!(link.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_send_and_await_ack() {
        let (link, mut coordinator) = connect(LinkConfig::default());

        let device = tokio::spawn(async move {
            let command = coordinator.read_message().await;
            assert_eq!(command.msg_type, 0x0092);
            assert_eq!(command.payload.as_ref(), &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01]);
            coordinator.acknowledge(0, 42, command.msg_type).await;
            coordinator
        });

        let ack = link
            .send_and_ack(0x0092, &[0x02, 0x12, 0x34, 0x01, 0x01, 0x01])
            .await
            .unwrap();
        assert_eq!(ack.sequence, 42);
        assert_eq!(ack.original_type, 0x0092);
        assert!(ack.is_success());
        device.await.unwrap();
        assert_eq!(link.stats().delivered_to_waiters, 1);
    }

    #[tokio::test]
    async fn test_failure_status_is_surfaced() {
        let (link, mut coordinator) = connect(LinkConfig::default());

        let device = tokio::spawn(async move {
            let command = coordinator.read_message().await;
            coordinator.acknowledge(0x85, 0, command.msg_type).await;
            coordinator
        });

        let err = link
            .send_and_await_ack(0x0049, &[0xFF, 0xFC, 0x1E, 0x00], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Status {
                msg_type: 0x0049,
                status: 0x85,
                ..
            }
        ));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let (link, _coordinator) = connect(LinkConfig::default());
        let err = link
            .send_and_await_ack(0x0011, &[], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 100 }));

        // The send lock and the slot were released
        let err = link
            .send_and_await_ack(0x0011, &[], Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_acks_are_not_crossed() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let link = Arc::new(link);

        let device = tokio::spawn(async move {
            for _ in 0..2 {
                let command = coordinator.read_message().await;
                // An acknowledgement nobody asked for arrives first
                coordinator.acknowledge(0, 0xEE, 0x0030).await;
                coordinator
                    .acknowledge(0, command.msg_type as u8, command.msg_type)
                    .await;
            }
            coordinator
        });

        let first = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.send_and_await_ack(0x0010, &[1], Duration::from_secs(2))
                    .await
            })
        };
        let second = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.send_and_await_ack(0x0020, &[2], Duration::from_secs(2))
                    .await
            })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!((first.original_type, first.sequence), (0x0010, 0x10));
        assert_eq!((second.original_type, second.sequence), (0x0020, 0x20));
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_waits_for_response() {
        let (link, mut coordinator) = connect(LinkConfig::default());

        let device = tokio::spawn(async move {
            let command = coordinator.read_message().await;
            assert_eq!(command.msg_type, MessageType::GetVersion.as_u16());
            // Response is written immediately after the acknowledgement
            coordinator.acknowledge(0, 1, command.msg_type).await;
            coordinator
                .write_message(MessageType::VersionList.as_u16(), &[0x00, 0x03, 0x03, 0x0A])
                .await;
            coordinator
        });

        let version = link
            .request(
                MessageType::GetVersion.as_u16(),
                &[],
                MessageType::VersionList.as_u16(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(version.payload.as_ref(), &[0x00, 0x03, 0x03, 0x0A]);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_receives_unsolicited_message() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register(ANNOUNCE, move |message: &Message| {
            let _ = tx.send(message.clone());
        })
        .unwrap();

        let announce = [0x12, 0x34, 0x00, 0x15, 0x8D, 0x00, 0x01, 0x02, 0x03, 0x04, 0x8E];
        coordinator.write_message(ANNOUNCE, &announce).await;

        let message = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message, Message::new(ANNOUNCE, announce.to_vec()));
        assert_eq!(link.stats().callbacks_queued, 1);
    }

    #[tokio::test]
    async fn test_waiter_and_callback_both_receive() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register(REPORT, move |message: &Message| {
            let _ = tx.send(message.payload.clone());
        })
        .unwrap();

        let pending = link.claim(WaitTarget::message(REPORT)).unwrap();
        coordinator.write_message(REPORT, &[0xAA, 0xBB]).await;

        let waited = pending.wait(Duration::from_secs(2)).await.unwrap();
        let called = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(waited.payload.as_ref(), &[0xAA, 0xBB]);
        assert_eq!(called.as_ref(), &[0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn test_callbacks_keep_arrival_order() {
        let (link, mut coordinator) =
            connect(LinkConfig::default().enqueue_timeout(Duration::from_secs(5)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register(REPORT, move |message: &Message| {
            let _ = tx.send(message.payload[0]);
        })
        .unwrap();

        for value in 0..8u8 {
            coordinator.write_message(REPORT, &[0x10 + value]).await;
        }

        let mut seen = Vec::new();
        while seen.len() < 8 {
            let value = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(value);
        }
        assert_eq!(seen, (0x10..0x18).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_unregister_stops_callbacks() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = link
            .register(REPORT, move |message: &Message| {
                let _ = tx.send(message.msg_type);
            })
            .unwrap();
        assert!(matches!(
            link.register(REPORT, |_: &Message| {}),
            Err(Error::HandlerExists { .. })
        ));

        link.unregister(REPORT, id).unwrap();
        // Sentinel proves the report was processed
        let sentinel = link.claim(WaitTarget::message(ANNOUNCE)).unwrap();
        coordinator.write_message(REPORT, &[0x01]).await;
        coordinator.write_message(ANNOUNCE, &[0x02]).await;
        sentinel.wait(Duration::from_secs(2)).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(link.stats().unhandled, 1);
    }

    #[tokio::test]
    async fn test_log_messages_stay_inline() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.register(LOG, move |message: &Message| {
            let _ = tx.send(message.msg_type);
        })
        .unwrap();

        let pending = link.claim(WaitTarget::message(REPORT)).unwrap();
        coordinator.write_message(LOG, b"\x06Network formed").await;
        coordinator.write_message(REPORT, &[0x01]).await;
        pending.wait(Duration::from_secs(2)).await.unwrap();

        assert!(rx.try_recv().is_err());
        let stats = link.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.delivered_to_waiters, 1);
        assert_eq!(stats.unhandled, 0);
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_dropped_and_link_resyncs() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        let pending = link.claim(WaitTarget::message(REPORT)).unwrap();

        let mut corrupt = encode_frame(REPORT, &[0x55, 0x66]).unwrap().to_vec();
        let last_payload = corrupt.len() - 2;
        corrupt[last_payload] ^= 0x01;
        coordinator.write_raw(&corrupt).await;
        coordinator.write_raw(&[0x01, 0x81]).await;
        coordinator.write_message(REPORT, &[0x77]).await;

        let message = pending.wait(Duration::from_secs(2)).await.unwrap();
        assert_eq!(message.payload.as_ref(), &[0x77]);
        assert_eq!(link.stats().frames_rejected, 1);
    }

    #[tokio::test]
    async fn test_unsolicited_message_is_counted() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        coordinator.write_message(0x8048, &[0x00]).await;
        coordinator.write_message(REPORT, &[0x01]).await;

        let pending = link.claim(WaitTarget::message(ANNOUNCE)).unwrap();
        coordinator.write_message(ANNOUNCE, &[0x02]).await;
        pending.wait(Duration::from_secs(2)).await.unwrap();

        assert_eq!(link.stats().unhandled, 2);
    }

    #[tokio::test]
    async fn test_stop_interrupts_reader_and_waiters() {
        let (link, _coordinator) = connect(LinkConfig::default());
        let link = Arc::new(link);

        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.await_message(REPORT, Duration::from_secs(30)).await })
        };
        while link.waits.occupied() == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::timeout(Duration::from_secs(2), link.stop())
            .await
            .unwrap();

        assert!(matches!(waiter.await.unwrap(), Err(Error::LinkClosed)));
        assert_eq!(link.state(), LinkState::Stopped);
        assert!(matches!(
            link.send(0x0010, &[]).await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            link.await_message(REPORT, Duration::from_secs(1)).await,
            Err(Error::LinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_transport_eof_fails_link() {
        let (link, coordinator) = connect(LinkConfig::default());
        let pending = link.claim(WaitTarget::message(REPORT)).unwrap();

        drop(coordinator);
        wait_for_state(&link, |state| matches!(state, LinkState::Failed(_))).await;

        assert!(matches!(
            pending.wait(Duration::from_secs(2)).await,
            Err(Error::LinkClosed)
        ));
        assert!(matches!(
            link.send(0x0010, &[]).await,
            Err(Error::NotConnected)
        ));

        link.stop().await;
        assert!(matches!(link.state(), LinkState::Failed(_)));
    }

    #[tokio::test]
    async fn test_links_are_independent() {
        let (first, mut first_device) = connect(LinkConfig::default());
        let (second, _second_device) = connect(LinkConfig::default().wait_slots(1));

        let pending = second.claim(WaitTarget::message(REPORT)).unwrap();
        assert!(matches!(
            second.claim(WaitTarget::message(ANNOUNCE)),
            Err(Error::Overloaded { capacity: 1 })
        ));

        let report = first.claim(WaitTarget::message(REPORT)).unwrap();
        first_device.write_message(REPORT, &[0x01]).await;
        report.wait(Duration::from_secs(2)).await.unwrap();

        drop(pending);
        assert_eq!(second.stats().frames_received, 0);
    }

    #[tokio::test]
    async fn test_stalled_write_is_bounded_by_ack_timeout() {
        // The coordinator never reads, so the pipe fills up mid-frame
        let (link, _coordinator) = connect_with_buffer(LinkConfig::default(), 64);

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            link.send_and_await_ack(0x0010, &[0; 200], Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, Err(Error::Timeout { timeout_ms: 100 })));

        // A partial frame is on the wire
        assert!(matches!(link.state(), LinkState::Failed(_)));
        assert!(matches!(
            link.send(0x0010, &[]).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_stalled_send_is_bounded_by_write_timeout() {
        let config = LinkConfig::default().write_timeout(Duration::from_millis(50));
        let (link, _coordinator) = connect_with_buffer(config, 64);

        let outcome = tokio::time::timeout(Duration::from_secs(2), link.send(0x0010, &[0; 200]))
            .await
            .unwrap();
        assert!(matches!(outcome, Err(Error::Timeout { timeout_ms: 50 })));
        assert_eq!(link.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_stalled_write() {
        let config = LinkConfig::default().write_timeout(Duration::from_secs(30));
        let (link, _coordinator) = connect_with_buffer(config, 64);
        let link = Arc::new(link);

        let sender = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.send(0x0010, &[0; 200]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(2), link.stop())
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), sender)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            Err(Error::LinkClosed | Error::NotConnected)
        ));
        assert_eq!(link.state(), LinkState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_closes_stream() {
        let (link, mut coordinator) = connect(LinkConfig::default());
        link.send(0x0010, &[0x01]).await.unwrap();
        coordinator.read_message().await;

        link.stop().await;

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_millis(500), coordinator.stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_message_skips_retry_delay() {
        let config = LinkConfig::default().delivery_retry_delay(Duration::from_secs(3600));
        let (link, mut coordinator) = connect(config);
        let sentinel = link.claim(WaitTarget::message(ANNOUNCE)).unwrap();

        let start = Instant::now();
        coordinator.write_message(REPORT, &[0x01]).await;
        coordinator.write_message(ANNOUNCE, &[0x02]).await;
        sentinel.wait(Duration::from_secs(10)).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(link.stats().unhandled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_waiter_is_retried_once() {
        let delay = Duration::from_millis(200);
        let (link, mut coordinator) = connect(LinkConfig::default().delivery_retry_delay(delay));
        let mut gone = link.claim(WaitTarget::message(REPORT)).unwrap();
        gone.abandon();
        let sentinel = link.claim(WaitTarget::message(ANNOUNCE)).unwrap();

        let start = Instant::now();
        coordinator.write_message(REPORT, &[0x01]).await;
        coordinator.write_message(ANNOUNCE, &[0x02]).await;
        sentinel.wait(Duration::from_secs(10)).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= delay);
        assert!(elapsed < delay * 2);
        let stats = link.stats();
        assert_eq!(stats.delivered_to_waiters, 1);
        assert_eq!(stats.unhandled, 1);
        drop(gone);
    }
}
