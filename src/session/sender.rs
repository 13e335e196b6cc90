//! The single-stream send loop.
//!
//! One session, one TCP connection, one policy. The loop is fully
//! select-driven: every suspension point (closed window, pacing delay,
//! ACK wait, RTO timer) also observes the cancellation watch, so a cancel
//! lands promptly regardless of what the session is waiting on.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::{Config, TransferError};
use crate::crypto::{self, SessionKeys};
use crate::membership::Backoff;
use crate::policy::{LossAction, SendContext, SendDecision, SendPolicy};
use crate::stats::{RetransmitReason, TransferObserver};
use crate::wire::{
    ControlMessage, ControlType, FileInfo, Frame, FrameCodec, FrameFlags, FrameType, WireError,
};

use super::state::{StateMachine, TransferEvent, TransferPhase};
use super::{elapsed_ms, frame_aad, hex_decode, unwrap_sequence};

/// Everything one sender session needs, owned, so sessions can run as
/// spawned tasks.
pub(crate) struct SessionParams {
    pub config: Config,
    pub path: PathBuf,
    pub target: SocketAddr,
    pub policy: Box<dyn SendPolicy>,
    pub info: FileInfo,
    pub observer: Arc<dyn TransferObserver>,
    pub cancel: watch::Receiver<bool>,
    pub high_priority: bool,
}

/// What a finished (or failed) session reports back.
pub(crate) struct SessionOutcome {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
    pub retransmits: u64,
    pub duration_ms: u64,
    pub result: Result<(), TransferError>,
}

#[derive(Default)]
struct Counters {
    bytes_sent: u64,
    chunks_sent: u64,
    retransmits: u64,
}

struct SentChunk {
    payload: Vec<u8>,
    sent_at: Instant,
    retransmitted: bool,
}

enum AckClass {
    New(u64),
    Duplicate,
    Stale,
}

struct SendWindow {
    next_seq: u64,
    last_acked: Option<u64>,
    outstanding: BTreeMap<u64, SentChunk>,
}

impl SendWindow {
    fn new() -> Self {
        Self {
            next_seq: 0,
            last_acked: None,
            outstanding: BTreeMap::new(),
        }
    }

    fn outstanding_bytes(&self) -> usize {
        self.outstanding.values().map(|c| c.payload.len()).sum()
    }

    /// Classify an ACK's wire sequence against the cumulative edge. Any
    /// ACK at or below the edge is a duplicate candidate; an ACK for a
    /// sequence never sent is ignored.
    fn classify(&self, wire: u16) -> AckClass {
        match self.last_acked {
            None => {
                if wire == u16::MAX {
                    // next_expected - 1 with nothing delivered yet.
                    return AckClass::Duplicate;
                }
                let cum = unwrap_sequence(wire, 0);
                if cum < self.next_seq {
                    AckClass::New(cum)
                } else {
                    AckClass::Stale
                }
            }
            Some(last) => {
                let cum = unwrap_sequence(wire, last);
                if cum >= self.next_seq {
                    AckClass::Stale
                } else if cum <= last {
                    AckClass::Duplicate
                } else {
                    AckClass::New(cum)
                }
            }
        }
    }

    /// Drop every outstanding chunk at or below `cum`, returning the byte
    /// count and whether the edge chunk is usable as an RTT sample.
    fn advance(&mut self, cum: u64) -> (usize, bool) {
        let keep = self.outstanding.split_off(&(cum + 1));
        let drained = std::mem::replace(&mut self.outstanding, keep);
        let bytes = drained.values().map(|c| c.payload.len()).sum();
        let clean_sample = drained
            .get(&cum)
            .map(|chunk| !chunk.retransmitted)
            .unwrap_or(false);
        self.last_acked = Some(cum);
        (bytes, clean_sample)
    }

    fn oldest_sent_at(&self) -> Option<Instant> {
        self.outstanding.values().map(|c| c.sent_at).min()
    }
}

/// Run one sender session to completion.
pub(crate) async fn run_sender(params: SessionParams) -> SessionOutcome {
    let started = Instant::now();
    let mut counters = Counters::default();
    let result = drive(params, &mut counters).await;
    SessionOutcome {
        bytes_sent: counters.bytes_sent,
        chunks_sent: counters.chunks_sent,
        retransmits: counters.retransmits,
        duration_ms: started.elapsed().as_millis() as u64,
        result,
    }
}

async fn drive(mut params: SessionParams, counters: &mut Counters) -> Result<(), TransferError> {
    let config = params.config.clone();
    let observer = Arc::clone(&params.observer);
    let mut machine = StateMachine::new();
    let mut cancel = params.cancel.clone();
    // A clone only observes sends made after it; a cancel that landed
    // before this session started must still take effect.
    if *cancel.borrow() {
        return Err(TransferError::Cancelled);
    }

    machine.apply(TransferEvent::InitiateSend)?;
    observer.on_phase_change(TransferPhase::Connecting);

    let stream = connect_with_backoff(params.target, &config, &mut cancel).await?;
    let _ = stream.set_nodelay(true);
    let (mut read, mut write) = stream.into_split();

    let handshake = SessionKeys::handshake(&config.shared_secret, config.pbkdf2_iterations);
    let salt = hex_decode(&params.info.salt)
        .ok_or_else(|| TransferError::Config("invalid session salt".into()))?;
    let session_keys = SessionKeys::derive(&config.shared_secret, &salt, config.pbkdf2_iterations);

    let epoch = Instant::now();
    let chunk_size = params.info.chunk_size as u64;
    let range_len = params.info.range_len;
    let total_chunks = range_len.div_ceil(chunk_size.max(1));

    // INIT carries the metadata as a FILE_INFO control message, sealed
    // under the handshake keys.
    let init_ts = elapsed_ms(epoch);
    let control = ControlMessage::new(ControlType::FileInfo, 0, init_ts, &params.info);
    let aad = frame_aad(FrameType::Init, 0, init_ts);
    let envelope = crypto::seal(&handshake, &aad, &control.encode());
    let mut init = Frame::new(FrameType::Init, 0, init_ts, envelope);
    init.flags = FrameFlags::ENCRYPTED.with(FrameFlags::REQUIRES_ACK);
    write.write_all(&init.encode(handshake.mac_key())).await?;
    debug!(target = %params.target, file = %params.info.file_name, "sent INIT");

    let mut codec = FrameCodec::new(crate::wire::MAX_PAYLOAD_LEN);
    let deadline = Instant::now() + config.connection_timeout;
    loop {
        match read_frame_until(&mut read, &mut codec, handshake.mac_key(), deadline, &mut cancel)
            .await
        {
            Ok(Some(frame)) if frame.frame_type == FrameType::Ack && frame.sequence == 0 => break,
            Ok(Some(frame)) if frame.frame_type == FrameType::Error => {
                machine.apply(TransferEvent::PeerReset)?;
                observer.on_phase_change(TransferPhase::Error);
                return Err(TransferError::PeerAbort(error_detail(&frame)));
            }
            Ok(Some(frame)) if frame.frame_type == FrameType::Rst => {
                machine.apply(TransferEvent::PeerReset)?;
                observer.on_phase_change(TransferPhase::Error);
                return Err(TransferError::PeerAbort("reset during handshake".into()));
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                machine.apply(TransferEvent::HandshakeTimeout)?;
                observer.on_phase_change(TransferPhase::Error);
                return Err(TransferError::HandshakeTimeout);
            }
            Err(TransferError::Cancelled) => {
                return Err(finish_cancelled(
                    &mut machine,
                    &observer,
                    &mut write,
                    &mut read,
                    &session_keys,
                    &config,
                    epoch,
                )
                .await);
            }
            Err(other) => return Err(other),
        }
    }

    machine.apply(TransferEvent::InitAcked)?;
    observer.on_phase_change(TransferPhase::Transfer);
    info!(
        target = %params.target,
        file = %params.info.file_name,
        range = params.info.range_index,
        chunks = total_chunks,
        "transfer started"
    );

    let mut file = tokio::fs::File::open(&params.path).await?;
    file.seek(SeekFrom::Start(params.info.range_offset)).await?;

    let mut window = SendWindow::new();
    let mut read_buf = vec![0u8; 16 * 1024];
    let mut paused = false;
    let mut mac_failures = 0u32;

    'transfer: loop {
        // Drain complete inbound frames before every send decision.
        loop {
            let frame = match codec.next_frame(session_keys.mac_key()) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(WireError::TokenMismatch) => {
                    // Framing is intact: drop the frame silently, count it.
                    mac_failures += 1;
                    observer.on_mac_failure();
                    if mac_failures >= config.mac_failure_threshold {
                        machine.apply(TransferEvent::PeerError)?;
                        observer.on_phase_change(TransferPhase::Error);
                        return Err(TransferError::MacFailureRate);
                    }
                    if !codec.skip_frame() {
                        break;
                    }
                    continue;
                }
                Err(error) => {
                    let _ = machine.apply(TransferEvent::PeerError);
                    observer.on_phase_change(TransferPhase::Error);
                    return Err(error.into());
                }
            };
            match frame.frame_type {
                FrameType::Ack => match window.classify(frame.sequence) {
                    AckClass::New(cum) => {
                        let (acked_bytes, clean) = window.advance(cum);
                        let rtt = clean
                            .then(|| {
                                let now_ms = elapsed_ms(epoch);
                                (now_ms >= frame.timestamp).then(|| {
                                    Duration::from_millis(u64::from(now_ms - frame.timestamp))
                                })
                            })
                            .flatten();
                        params.policy.on_new_ack(acked_bytes, rtt);
                        observer.on_ack(cum);
                        observer.on_window_change(params.policy.window());
                    }
                    AckClass::Duplicate => {
                        if params.policy.on_dup_ack() == LossAction::Retransmit {
                            retransmit_lowest(
                                &mut write,
                                &mut window,
                                &session_keys,
                                epoch,
                                params.high_priority,
                                RetransmitReason::FastRetransmit,
                                &observer,
                                counters,
                            )
                            .await?;
                            observer.on_window_change(params.policy.window());
                        }
                    }
                    AckClass::Stale => {}
                },
                FrameType::Pause => {
                    debug!("receiver paused the stream");
                    paused = true;
                }
                FrameType::Resume => {
                    debug!("receiver resumed the stream");
                    paused = false;
                }
                FrameType::Error => {
                    machine.apply(TransferEvent::PeerError)?;
                    observer.on_phase_change(TransferPhase::Error);
                    return Err(TransferError::PeerAbort(error_detail(&frame)));
                }
                FrameType::Rst => {
                    machine.apply(TransferEvent::PeerReset)?;
                    observer.on_phase_change(TransferPhase::Error);
                    return Err(TransferError::PeerAbort("connection reset by peer".into()));
                }
                other => debug!(frame = ?other, "ignoring unexpected frame"),
            }
        }

        if window.outstanding.is_empty() && window.next_seq >= total_chunks {
            break 'transfer;
        }

        let next_chunk_len = if paused || window.next_seq >= total_chunks {
            None
        } else {
            let offset = window.next_seq * chunk_size;
            Some(((range_len - offset).min(chunk_size)) as usize)
        };
        let ctx = SendContext {
            now: Instant::now(),
            outstanding_bytes: window.outstanding_bytes(),
            outstanding_chunks: window.outstanding.len(),
            next_chunk_len,
        };
        let decision = params.policy.decide(&ctx);

        if decision == SendDecision::Transmit {
            let len = next_chunk_len.unwrap_or(0);
            let mut chunk = vec![0u8; len];
            file.read_exact(&mut chunk).await?;
            let ts = elapsed_ms(epoch);
            let seq = window.next_seq;
            let aad = frame_aad(FrameType::Data, seq as u16, ts);
            let envelope = crypto::seal(&session_keys, &aad, &chunk);
            let mut frame = Frame::data(seq as u16, ts, envelope);
            if params.high_priority {
                frame.flags = frame.flags.with(FrameFlags::HIGH_PRIORITY);
            }
            write.write_all(&frame.encode(session_keys.mac_key())).await?;
            window.outstanding.insert(
                seq,
                SentChunk {
                    payload: chunk,
                    sent_at: Instant::now(),
                    retransmitted: false,
                },
            );
            window.next_seq += 1;
            params.policy.on_transmit(len, Instant::now());
            observer.on_chunk_sent(seq, len);
            counters.chunks_sent += 1;
            counters.bytes_sent += len as u64;
            continue;
        }

        // Suspension point: wait for an ACK, a pacing instant, the RTO
        // timer, or cancellation, whichever comes first.
        let rto_at = params
            .policy
            .rto()
            .and_then(|rto| window.oldest_sent_at().map(|sent| sent + rto));
        let pace_at = match decision {
            SendDecision::Wait(at) => Some(at),
            _ => None,
        };
        let wake_at = match (pace_at, rto_at) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            // Nothing scheduled: only an ACK or cancel can wake us.
            (None, None) => Instant::now() + Duration::from_secs(3600),
        };

        tokio::select! {
            _ = cancel.changed() => {
                return Err(finish_cancelled(
                    &mut machine, &observer, &mut write, &mut read,
                    &session_keys, &config, epoch,
                ).await);
            }
            received = read.read(&mut read_buf) => {
                let n = received?;
                if n == 0 {
                    let _ = machine.apply(TransferEvent::PeerReset);
                    observer.on_phase_change(TransferPhase::Error);
                    return Err(TransferError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed mid-transfer",
                    )));
                }
                codec.extend(&read_buf[..n]);
            }
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake_at)) => {
                if let Some(at) = rto_at {
                    if Instant::now() >= at {
                        match params.policy.on_rto_expiry() {
                            LossAction::Retransmit => {
                                retransmit_lowest(
                                    &mut write, &mut window, &session_keys, epoch,
                                    params.high_priority, RetransmitReason::Timeout,
                                    &observer, counters,
                                ).await?;
                                observer.on_window_change(params.policy.window());
                            }
                            LossAction::Fatal => {
                                machine.apply(TransferEvent::FatalTimeout)?;
                                observer.on_phase_change(TransferPhase::Error);
                                return Err(TransferError::AckTimeout);
                            }
                            LossAction::Stall => {
                                machine.apply(TransferEvent::FatalTimeout)?;
                                observer.on_phase_change(TransferPhase::Error);
                                return Err(TransferError::Stalled);
                            }
                            LossAction::None => {}
                        }
                    }
                }
            }
        }
    }

    // All chunks cumulatively acknowledged: validate.
    machine.apply(TransferEvent::LastChunkAcked)?;
    observer.on_phase_change(TransferPhase::Validating);
    let fin_wire = (total_chunks % 65_536) as u16;
    let fin_ts = elapsed_ms(epoch);
    let mut fin = Frame::new(FrameType::Fin, fin_wire, fin_ts, Vec::new());
    fin.flags = FrameFlags::REQUIRES_ACK;
    write.write_all(&fin.encode(session_keys.mac_key())).await?;

    let deadline = Instant::now() + config.connection_timeout;
    loop {
        match read_frame_until(
            &mut read,
            &mut codec,
            session_keys.mac_key(),
            deadline,
            &mut cancel,
        )
        .await
        {
            Ok(Some(frame)) if frame.frame_type == FrameType::Ack && frame.sequence == fin_wire => {
                machine.apply(TransferEvent::ValidationPassed)?;
                observer.on_phase_change(TransferPhase::Completed);
                info!(file = %params.info.file_name, range = params.info.range_index, "transfer completed");
                return Ok(());
            }
            Ok(Some(frame)) if frame.frame_type == FrameType::Error => {
                machine.apply(TransferEvent::ValidationFailed)?;
                observer.on_phase_change(TransferPhase::Error);
                warn!(detail = %error_detail(&frame), "receiver rejected the file");
                return Err(TransferError::Integrity);
            }
            Ok(Some(frame)) if frame.frame_type == FrameType::Rst => {
                machine.apply(TransferEvent::PeerReset)?;
                observer.on_phase_change(TransferPhase::Error);
                return Err(TransferError::PeerAbort("reset during validation".into()));
            }
            Ok(Some(_)) => continue,
            Ok(None) => {
                machine.apply(TransferEvent::FatalTimeout)?;
                observer.on_phase_change(TransferPhase::Error);
                return Err(TransferError::AckTimeout);
            }
            Err(TransferError::Cancelled) => {
                return Err(finish_cancelled(
                    &mut machine,
                    &observer,
                    &mut write,
                    &mut read,
                    &session_keys,
                    &config,
                    epoch,
                )
                .await);
            }
            Err(other) => return Err(other),
        }
    }
}

async fn connect_with_backoff(
    target: SocketAddr,
    config: &Config,
    cancel: &mut watch::Receiver<bool>,
) -> Result<TcpStream, TransferError> {
    let mut backoff = Backoff::new(config.max_retries);
    loop {
        let attempt = tokio::time::timeout(config.connection_timeout, TcpStream::connect(target));
        let error = match attempt.await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(error)) => error,
            Err(_) => std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        };
        match backoff.next_delay() {
            Some(delay) => {
                warn!(%target, %error, ?delay, "connect failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.changed() => return Err(TransferError::Cancelled),
                }
            }
            None => return Err(TransferError::Transport(error)),
        }
    }
}

/// Read frames until the deadline, yielding the next complete one.
/// `Ok(None)` means the deadline passed.
pub(crate) async fn read_frame_until(
    read: &mut OwnedReadHalf,
    codec: &mut FrameCodec,
    mac_key: &[u8],
    deadline: Instant,
    cancel: &mut watch::Receiver<bool>,
) -> Result<Option<Frame>, TransferError> {
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        if let Some(frame) = codec.next_frame(mac_key)? {
            return Ok(Some(frame));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::select! {
            _ = cancel.changed() => return Err(TransferError::Cancelled),
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                return Ok(None);
            }
            received = read.read(&mut buf) => {
                let n = received?;
                if n == 0 {
                    return Err(TransferError::Transport(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed",
                    )));
                }
                codec.extend(&buf[..n]);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn retransmit_lowest(
    write: &mut OwnedWriteHalf,
    window: &mut SendWindow,
    keys: &SessionKeys,
    epoch: Instant,
    high_priority: bool,
    reason: RetransmitReason,
    observer: &Arc<dyn TransferObserver>,
    counters: &mut Counters,
) -> Result<(), TransferError> {
    let Some((&seq, _)) = window.outstanding.iter().next() else {
        return Ok(());
    };
    let ts = elapsed_ms(epoch);
    let bytes = {
        let Some(chunk) = window.outstanding.get_mut(&seq) else {
            return Ok(());
        };
        chunk.retransmitted = true;
        chunk.sent_at = Instant::now();
        let aad = frame_aad(FrameType::Data, seq as u16, ts);
        let envelope = crypto::seal(keys, &aad, &chunk.payload);
        let mut frame = Frame::data(seq as u16, ts, envelope);
        if high_priority {
            frame.flags = frame.flags.with(FrameFlags::HIGH_PRIORITY);
        }
        frame.encode(keys.mac_key())
    };
    write.write_all(&bytes).await?;
    counters.retransmits += 1;
    observer.on_retransmit(seq, reason);
    debug!(seq, ?reason, "retransmitted chunk");
    Ok(())
}

/// Cancellation: move to ERROR, send RST, drain ACKs for the grace period,
/// and report `Cancelled`.
async fn finish_cancelled(
    machine: &mut StateMachine,
    observer: &Arc<dyn TransferObserver>,
    write: &mut OwnedWriteHalf,
    read: &mut OwnedReadHalf,
    keys: &SessionKeys,
    config: &Config,
    epoch: Instant,
) -> TransferError {
    let _ = machine.apply(TransferEvent::Cancelled);
    observer.on_phase_change(TransferPhase::Error);
    let rst = Frame::new(FrameType::Rst, 0, elapsed_ms(epoch), Vec::new());
    let _ = write.write_all(&rst.encode(keys.mac_key())).await;
    let _ = write.flush().await;

    let deadline = Instant::now() + config.cancel_grace;
    let mut buf = vec![0u8; 4 * 1024];
    while Instant::now() < deadline {
        let remaining = deadline - Instant::now();
        match tokio::time::timeout(remaining, read.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => continue,
            _ => break,
        }
    }
    info!("session cancelled");
    TransferError::Cancelled
}

fn error_detail(frame: &Frame) -> String {
    // ERROR frames carry a control message in clear (the session may be
    // failing precisely because keys disagree).
    ControlMessage::decode(&frame.payload)
        .ok()
        .and_then(|msg| msg.parse_params::<crate::wire::ErrorParams>().ok())
        .map(|params| params.detail)
        .unwrap_or_else(|| "unspecified peer error".into())
}
