//! Inbound session handling.
//!
//! The receiver listens on a bound endpoint and runs one session task per
//! accepted connection: validate INIT, allocate the reassembly state, ACK
//! the handshake, then place DATA chunks, emit cumulative ACKs, and settle
//! the file-level checksum at FIN. Parallel range sessions share output
//! files through a [`TransferRegistry`].

mod reassembly;
mod registry;

pub use reassembly::{Placement, Reassembler};
pub use registry::TransferRegistry;

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Config, ReasonCode, TransferError, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::crypto::{self, SessionKeys};
use crate::session::{
    elapsed_ms, file_sha256, frame_aad, hex_decode, hex_encode, read_frame_until, unwrap_sequence,
};
use crate::stats::{NullObserver, TransferObserver};
use crate::wire::{
    ControlMessage, ControlType, ErrorParams, FileInfo, Frame, FrameCodec, FrameType, WireError,
    MAX_PAYLOAD_LEN,
};

use registry::RangeCompletion;

/// Shutdown handle for a running [`Receiver`].
#[derive(Debug, Clone)]
pub struct ReceiverHandle {
    cancel: watch::Sender<bool>,
}

impl ReceiverHandle {
    /// Stop accepting connections and wind down session tasks.
    pub fn shutdown(&self) {
        let _ = self.cancel.send(true);
    }
}

/// The inbound side of the transfer protocol.
pub struct Receiver {
    config: Config,
    observer: Arc<dyn TransferObserver>,
    registry: Arc<TransferRegistry>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Receiver {
    /// Create a receiver writing into `config.data_dir`.
    pub fn new(config: Config) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            config,
            observer: Arc::new(NullObserver),
            registry: Arc::new(TransferRegistry::new()),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Inject an observer for inbound events.
    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Shutdown handle.
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            cancel: self.cancel_tx.clone(),
        }
    }

    /// Accept sessions until shutdown.
    pub async fn serve(self, listener: TcpListener) -> Result<(), TransferError> {
        let mut cancel = self.cancel_rx.clone();
        info!(addr = ?listener.local_addr().ok(), "receiver listening");
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    info!("receiver shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let session = InboundSession {
                        config: self.config.clone(),
                        observer: Arc::clone(&self.observer),
                        registry: Arc::clone(&self.registry),
                        cancel: self.cancel_rx.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(error) = session.run(stream, peer).await {
                            warn!(%peer, %error, "inbound session failed");
                        }
                    });
                }
            }
        }
    }
}

struct InboundSession {
    config: Config,
    observer: Arc<dyn TransferObserver>,
    registry: Arc<TransferRegistry>,
    cancel: watch::Receiver<bool>,
}

impl InboundSession {
    async fn run(self, stream: TcpStream, peer: SocketAddr) -> Result<(), TransferError> {
        let _ = stream.set_nodelay(true);
        let (mut read, mut write) = stream.into_split();
        let mut codec = FrameCodec::new(MAX_PAYLOAD_LEN);
        let mut cancel = self.cancel.clone();
        let epoch = Instant::now();

        let handshake =
            SessionKeys::handshake(&self.config.shared_secret, self.config.pbkdf2_iterations);

        // INIT, sealed under the handshake keys.
        let deadline = Instant::now() + self.config.connection_timeout;
        let init = loop {
            match read_frame_until(&mut read, &mut codec, handshake.mac_key(), deadline, &mut cancel)
                .await
            {
                Ok(Some(frame)) if frame.frame_type == FrameType::Init => break frame,
                Ok(Some(frame)) => {
                    debug!(%peer, frame = ?frame.frame_type, "expected INIT");
                    continue;
                }
                Ok(None) => return Err(TransferError::HandshakeTimeout),
                Err(error) => {
                    send_rst(&mut write, &handshake, epoch).await;
                    return Err(error);
                }
            }
        };

        let aad = frame_aad(FrameType::Init, init.sequence, init.timestamp);
        let plaintext = match crypto::open(&handshake, &aad, &init.payload) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                self.observer.on_mac_failure();
                send_rst(&mut write, &handshake, epoch).await;
                return Err(error.into());
            }
        };
        let info: FileInfo = ControlMessage::decode(&plaintext)?.parse_params()?;
        let salt = match validate_init(&info) {
            Ok(salt) => salt,
            Err(error) => {
                send_rst(&mut write, &handshake, epoch).await;
                return Err(error);
            }
        };
        let keys = SessionKeys::derive(&self.config.shared_secret, &salt, self.config.pbkdf2_iterations);

        let path = output_path(&self.config.data_dir, &info.file_name);
        self.registry
            .register(&info.transfer_nonce, info.range_count, &path, info.file_len)?;
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;

        // ACK-of-INIT closes the handshake.
        let ack = Frame::ack(0, init.timestamp);
        write.write_all(&ack.encode(handshake.mac_key())).await?;
        info!(
            %peer,
            file = %info.file_name,
            len = info.file_len,
            range = info.range_index,
            ranges = info.range_count,
            "inbound transfer started"
        );

        let chunk_size = u64::from(info.chunk_size);
        let total_chunks = info.range_len.div_ceil(chunk_size.max(1));
        let mut reassembler =
            Reassembler::new(total_chunks, self.config.reorder_buffer_chunks);
        let mut mac_failures = 0u32;
        let mut paused = false;
        let mut read_buf = vec![0u8; 16 * 1024];

        loop {
            // Drain complete frames before waiting for more bytes.
            loop {
                let frame = match codec.next_frame(keys.mac_key()) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(WireError::TokenMismatch) => {
                        // The framing is intact; drop the frame silently
                        // and count it.
                        mac_failures += 1;
                        self.observer.on_mac_failure();
                        if mac_failures >= self.config.mac_failure_threshold {
                            send_error(
                                &mut write,
                                &keys,
                                epoch,
                                ReasonCode::Crypto,
                                "MAC failure rate exceeded",
                            )
                            .await;
                            return Err(TransferError::MacFailureRate);
                        }
                        if !codec.skip_frame() {
                            break;
                        }
                        continue;
                    }
                    Err(error) => {
                        send_rst(&mut write, &keys, epoch).await;
                        return Err(error.into());
                    }
                };
                match frame.frame_type {
                    FrameType::Data => {
                        let aad = frame_aad(FrameType::Data, frame.sequence, frame.timestamp);
                        let payload = match crypto::open(&keys, &aad, &frame.payload) {
                            Ok(payload) => payload,
                            Err(_) => {
                                // Crypto failures are dropped silently and
                                // counted; the frame is never processed.
                                mac_failures += 1;
                                self.observer.on_mac_failure();
                                if mac_failures >= self.config.mac_failure_threshold {
                                    send_error(
                                        &mut write,
                                        &keys,
                                        epoch,
                                        ReasonCode::Crypto,
                                        "MAC failure rate exceeded",
                                    )
                                    .await;
                                    return Err(TransferError::MacFailureRate);
                                }
                                continue;
                            }
                        };

                        let seq = unwrap_sequence(frame.sequence, reassembler.next_expected());
                        match reassembler.accept(seq, payload) {
                            Placement::Deliver(run) => {
                                for (chunk_seq, bytes) in run {
                                    let offset = info.range_offset + chunk_seq * chunk_size;
                                    file.seek(SeekFrom::Start(offset)).await?;
                                    file.write_all(&bytes).await?;
                                }
                            }
                            Placement::Duplicate | Placement::Buffered | Placement::Dropped => {}
                        }
                        // Cumulative ACK either advances or repeats the
                        // edge; repeats drive the sender's duplicate-ACK
                        // detection.
                        let ack = Frame::ack(reassembler.cumulative_wire(), frame.timestamp);
                        write.write_all(&ack.encode(keys.mac_key())).await?;

                        let cap = reassembler.cap();
                        if !paused && reassembler.buffered_len() * 4 >= cap * 3 {
                            paused = true;
                            let pause = Frame::new(
                                FrameType::Pause,
                                reassembler.cumulative_wire(),
                                elapsed_ms(epoch),
                                Vec::new(),
                            );
                            write.write_all(&pause.encode(keys.mac_key())).await?;
                            debug!(%peer, "reorder buffer saturated, paused sender");
                        } else if paused && reassembler.buffered_len() * 4 <= cap {
                            paused = false;
                            let resume = Frame::new(
                                FrameType::Resume,
                                reassembler.cumulative_wire(),
                                elapsed_ms(epoch),
                                Vec::new(),
                            );
                            write.write_all(&resume.encode(keys.mac_key())).await?;
                        }
                    }
                    FrameType::Fin => {
                        if !reassembler.is_complete() {
                            send_error(
                                &mut write,
                                &keys,
                                epoch,
                                ReasonCode::Protocol,
                                "FIN before all chunks arrived",
                            )
                            .await;
                            self.registry.forget(&info.transfer_nonce, true);
                            return Err(TransferError::PeerAbort("premature FIN".into()));
                        }
                        file.flush().await?;
                        file.sync_all().await?;

                        match self
                            .registry
                            .complete_range(&info.transfer_nonce, info.range_index)
                        {
                            RangeCompletion::MoreRemaining => {
                                let ack = Frame::ack(frame.sequence, frame.timestamp);
                                write.write_all(&ack.encode(keys.mac_key())).await?;
                                debug!(%peer, range = info.range_index, "range complete");
                                return Ok(());
                            }
                            RangeCompletion::AllComplete => {
                                let digest = file_sha256(&path).await?;
                                if hex_encode(&digest) == info.checksum {
                                    let ack = Frame::ack(frame.sequence, frame.timestamp);
                                    write.write_all(&ack.encode(keys.mac_key())).await?;
                                    self.registry.forget(&info.transfer_nonce, false);
                                    info!(%peer, file = %info.file_name, "file verified");
                                    return Ok(());
                                }
                                // Integrity failure: report, then delete
                                // the partial output.
                                send_error(
                                    &mut write,
                                    &keys,
                                    epoch,
                                    ReasonCode::Integrity,
                                    "file checksum mismatch",
                                )
                                .await;
                                self.registry.forget(&info.transfer_nonce, true);
                                warn!(%peer, file = %info.file_name, "checksum mismatch, output deleted");
                                return Err(TransferError::Integrity);
                            }
                        }
                    }
                    FrameType::Rst => {
                        debug!(%peer, "sender reset the session");
                        return Ok(());
                    }
                    other => debug!(%peer, frame = ?other, "ignoring unexpected frame"),
                };
            }

            tokio::select! {
                _ = cancel.changed() => {
                    send_rst(&mut write, &keys, epoch).await;
                    return Ok(());
                }
                received = read.read(&mut read_buf) => {
                    let n = received?;
                    if n == 0 {
                        return Err(TransferError::Transport(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed mid-transfer",
                        )));
                    }
                    codec.extend(&read_buf[..n]);
                }
            }
        }
    }
}

fn validate_init(info: &FileInfo) -> Result<Vec<u8>, TransferError> {
    let chunk = info.chunk_size as usize;
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
        return Err(TransferError::Config(format!(
            "chunk size {chunk} outside negotiable range"
        )));
    }
    if info.range_offset.checked_add(info.range_len).map(|end| end > info.file_len) != Some(false) {
        return Err(TransferError::Config("range exceeds file length".into()));
    }
    if info.range_count == 0 || info.range_index >= info.range_count {
        return Err(TransferError::Config("invalid range indexing".into()));
    }
    if info.checksum.len() != 64 || hex_decode(&info.checksum).is_none() {
        return Err(TransferError::Config("invalid checksum".into()));
    }
    if info.transfer_nonce.is_empty() {
        return Err(TransferError::Config("missing transfer nonce".into()));
    }
    let salt = hex_decode(&info.salt)
        .filter(|salt| salt.len() == crate::crypto::SALT_LEN)
        .ok_or_else(|| TransferError::Config("invalid session salt".into()))?;
    Ok(salt)
}

fn output_path(data_dir: &Path, file_name: &str) -> PathBuf {
    let base = Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "received.bin".into());
    data_dir.join(base)
}

async fn send_rst(write: &mut OwnedWriteHalf, keys: &SessionKeys, epoch: Instant) {
    let rst = Frame::new(FrameType::Rst, 0, elapsed_ms(epoch), Vec::new());
    let _ = write.write_all(&rst.encode(keys.mac_key())).await;
}

async fn send_error(
    write: &mut OwnedWriteHalf,
    keys: &SessionKeys,
    epoch: Instant,
    reason: ReasonCode,
    detail: &str,
) {
    let params = ErrorParams {
        reason,
        detail: detail.into(),
    };
    let message = ControlMessage::new(ControlType::Error, 0, elapsed_ms(epoch), &params);
    let frame = Frame::new(FrameType::Error, 0, elapsed_ms(epoch), message.encode());
    let _ = write.write_all(&frame.encode(keys.mac_key())).await;
}
