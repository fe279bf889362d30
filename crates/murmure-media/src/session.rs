//! Media session: one call's link, codec pair, audio pipeline and counters.
//!
//! The initiator opens the link after the remote ACCEPT; the callee receives
//! it through the transport's inbound-link callback. Either way the session
//! takes over the link, waits for establishment (bounded by the link
//! timeout), derives the SAS code, and runs the two audio paths:
//!
//! capture -> encode -> frame -> link send
//! link receive -> parse -> decode -> jitter buffer -> playback
//!
//! Link and transport callbacks run on transport threads; the audio device
//! callbacks run on the driver's realtime threads. They meet only at the
//! jitter buffer's short-hold lock and at lock-free channels.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use murmure_net::{Link, LinkEvent};
use murmure_shared::constants::LINK_TIMEOUT_SECS;
use murmure_shared::protocol::CodecOffer;
use murmure_shared::sas::{fallback_key_material, generate_sas};
use murmure_shared::types::{FrameType, NodeId};

use crate::audio::{AudioConfig, AudioEngine};
use crate::codec::{create_codec, CodecError, Decoder, Encoder};
use crate::framer;
use crate::jitter::{JitterBuffer, JitterStats};
use crate::metrics::CallMetrics;

/// Interval between RTT pings.
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Capture frames buffered between the device callback and the send task.
const CAPTURE_QUEUE_FRAMES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Link is up; audio is flowing. Carries the derived SAS code.
    Established { sas_code: String },
    /// Link never reached established within the timeout.
    LinkFailed,
    /// Link closed while the session was active.
    Closed,
}

#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    pub codec: CodecOffer,
    pub target_jitter_ms: u32,
    pub audio_enabled: bool,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub local_node: NodeId,
    pub remote_node: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityInfo {
    pub encrypted: bool,
    pub sas_code: Option<String>,
    pub sas_verified: bool,
}

pub struct MediaSession {
    link: Arc<dyn Link>,
    config: MediaSessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    runtime: tokio::runtime::Handle,

    active: Arc<AtomicBool>,
    established: Arc<AtomicBool>,
    tx_seq: Arc<AtomicU32>,
    epoch: Instant,

    encoder: Mutex<Option<Box<dyn Encoder>>>,
    decoder: Arc<Mutex<Box<dyn Decoder>>>,
    jitter: Arc<Mutex<JitterBuffer>>,
    metrics: Arc<Mutex<CallMetrics>>,
    audio: Mutex<Option<AudioEngine>>,

    sas_code: Mutex<Option<String>>,
    sas_material: Mutex<Vec<u8>>,
    sas_verified: AtomicBool,
}

impl MediaSession {
    /// Take over an established-or-pending link and run the call's media.
    ///
    /// Fails only on codec initialisation; that failure is fatal to the
    /// session and the caller ends the call with a codec-error outcome.
    /// Must be called from within a tokio runtime.
    pub fn start(
        link: Arc<dyn Link>,
        config: MediaSessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, CodecError> {
        let (encoder, decoder) = create_codec(config.codec)?;
        let frame_ms = encoder.frame_ms();
        let frame_samples = encoder.frame_size();

        let session = Arc::new(Self {
            link: link.clone(),
            events,
            runtime: tokio::runtime::Handle::current(),
            active: Arc::new(AtomicBool::new(true)),
            established: Arc::new(AtomicBool::new(false)),
            tx_seq: Arc::new(AtomicU32::new(0)),
            epoch: Instant::now(),
            encoder: Mutex::new(Some(encoder)),
            decoder: Arc::new(Mutex::new(decoder)),
            jitter: Arc::new(Mutex::new(JitterBuffer::new(
                config.target_jitter_ms,
                frame_ms,
                frame_samples,
            ))),
            metrics: Arc::new(Mutex::new(CallMetrics::new(frame_ms))),
            audio: Mutex::new(None),
            sas_code: Mutex::new(None),
            sas_material: Mutex::new(Vec::new()),
            sas_verified: AtomicBool::new(false),
            config,
        });

        // Weak from the link callback, or the link would keep the session
        // alive past teardown
        let weak = Arc::downgrade(&session);
        link.set_event_callback(Arc::new(move |event| {
            let Some(session) = weak.upgrade() else { return };
            match event {
                LinkEvent::Established => session.on_established(),
                LinkEvent::Packet(payload) => session.on_link_packet(&payload),
                LinkEvent::Closed => session.on_link_closed(),
            }
        }));

        // Establishment watchdog
        let watchdog = Arc::downgrade(&session);
        session.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(LINK_TIMEOUT_SECS)).await;
            let Some(session) = watchdog.upgrade() else { return };
            if session.active.load(Ordering::SeqCst)
                && !session.established.load(Ordering::SeqCst)
            {
                warn!("Media link failed to establish within {LINK_TIMEOUT_SECS}s");
                session.shutdown();
                let _ = session.events.send(SessionEvent::LinkFailed);
            }
        });

        Ok(session)
    }

    fn on_established(&self) {
        if !self.active.load(Ordering::SeqCst)
            || self.established.swap(true, Ordering::SeqCst)
        {
            return;
        }

        let material = match self.link.link_id() {
            Some(id) => id,
            None => fallback_key_material(&self.config.local_node, &self.config.remote_node),
        };
        let sas = generate_sas(&material);
        *self.sas_material.lock().unwrap() = material;
        *self.sas_code.lock().unwrap() = Some(sas.clone());
        info!(%sas, codec = %self.config.codec.codec, "Media link established");

        if self.config.audio_enabled {
            if let Err(err) = self.start_audio() {
                warn!(error = %err, "Audio unavailable, continuing without devices");
            }
        } else {
            debug!("Audio disabled for this session");
        }
        self.start_ping_task();

        let _ = self.events.send(SessionEvent::Established { sas_code: sas });
    }

    fn start_audio(&self) -> Result<(), crate::audio::AudioError> {
        let Some(mut encoder) = self.encoder.lock().unwrap().take() else {
            return Ok(());
        };

        let mut engine = AudioEngine::new(AudioConfig {
            sample_rate: encoder.sample_rate(),
            channels: 1,
            frame_size_ms: encoder.frame_ms(),
            input_device: self.config.input_device,
            output_device: self.config.output_device,
        });

        // Capture path: device callback -> channel -> encode/send task
        let (frame_tx, mut frame_rx) = mpsc::channel::<Vec<i16>>(CAPTURE_QUEUE_FRAMES);
        engine.start_capture(frame_tx)?;

        let link = self.link.clone();
        let active = self.active.clone();
        let tx_seq = self.tx_seq.clone();
        let metrics = self.metrics.clone();
        self.runtime.spawn(async move {
            while let Some(pcm) = frame_rx.recv().await {
                if !active.load(Ordering::Relaxed) {
                    break;
                }
                let encoded = match encoder.encode(&pcm) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        debug!(error = %err, "Dropping capture window");
                        metrics.lock().unwrap().encode_errors += 1;
                        continue;
                    }
                };
                let seq = tx_seq.fetch_add(1, Ordering::Relaxed);
                let packet = framer::frame(FrameType::Audio, seq, &encoded);
                metrics.lock().unwrap().record_sent(packet.len());
                if let Err(err) = link.send(&packet) {
                    debug!(error = %err, "Audio frame send failed");
                }
            }
            debug!("Capture send task exit");
        });

        // Playback path: device pulls from the jitter buffer on its own clock
        let jitter = self.jitter.clone();
        engine.start_playback(Arc::new(move || {
            let mut buf = jitter.lock().unwrap();
            buf.pop(Instant::now()).unwrap_or_else(|| buf.silence())
        }))?;

        *self.audio.lock().unwrap() = Some(engine);
        Ok(())
    }

    fn start_ping_task(&self) {
        let link = self.link.clone();
        let active = self.active.clone();
        let epoch = self.epoch;
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                ticker.tick().await;
                if !active.load(Ordering::Relaxed) {
                    break;
                }
                let millis = epoch.elapsed().as_millis() as u64;
                let packet = framer::frame(FrameType::Ping, 0, &framer::ping_payload(millis));
                if let Err(err) = link.send(&packet) {
                    debug!(error = %err, "Ping send failed");
                }
            }
        });
    }

    fn on_link_packet(&self, raw: &[u8]) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        let frame = match framer::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "Dropping malformed media frame");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Audio => {
                let pcm = match self.decoder.lock().unwrap().decode(&frame.payload) {
                    Ok(pcm) => pcm,
                    Err(err) => {
                        debug!(error = %err, "Dropping undecodable audio frame");
                        self.metrics.lock().unwrap().decode_errors += 1;
                        return;
                    }
                };
                self.metrics
                    .lock()
                    .unwrap()
                    .record_received(frame.seq, raw.len());
                self.jitter
                    .lock()
                    .unwrap()
                    .insert(frame.seq, pcm, Instant::now());
            }
            FrameType::Ping => {
                let pong = framer::frame(FrameType::Pong, 0, &frame.payload);
                if let Err(err) = self.link.send(&pong) {
                    debug!(error = %err, "Pong send failed");
                }
            }
            FrameType::Pong => {
                if let Some(sent_millis) = framer::parse_ping_payload(&frame.payload) {
                    let now = self.epoch.elapsed().as_millis() as u64;
                    let rtt = now.saturating_sub(sent_millis) as f64;
                    self.metrics.lock().unwrap().record_rtt(rtt);
                }
            }
            FrameType::Control => {
                debug!(len = frame.payload.len(), "Ignoring control frame");
            }
        }
    }

    fn on_link_closed(&self) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        info!("Media link closed");
        self.shutdown();
        let _ = self.events.send(SessionEvent::Closed);
    }

    /// Local teardown: stop audio, close the link, scrub key material.
    pub fn stop(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.audio.lock().unwrap().as_mut() {
            engine.stop();
        }
        self.jitter.lock().unwrap().clear();
        {
            // Zero SAS key material before releasing it
            let mut material = self.sas_material.lock().unwrap();
            material.fill(0);
            material.clear();
        }
        self.link.close();
        debug!("Media session torn down");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        if let Some(engine) = self.audio.lock().unwrap().as_mut() {
            engine.set_muted(muted);
        }
    }

    pub fn sas_code(&self) -> Option<String> {
        self.sas_code.lock().unwrap().clone()
    }

    pub fn mark_sas_verified(&self) {
        self.sas_verified.store(true, Ordering::SeqCst);
    }

    pub fn security_info(&self) -> SecurityInfo {
        SecurityInfo {
            encrypted: self.is_established(),
            sas_code: self.sas_code(),
            sas_verified: self.sas_verified.load(Ordering::SeqCst),
        }
    }

    pub fn metrics(&self) -> CallMetrics {
        self.metrics.lock().unwrap().clone()
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.lock().unwrap().stats()
    }
}
