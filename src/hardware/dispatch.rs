//! Inbound packet handling on the hardware side
//!
//! Each channel has a reader thread that decodes requests and either handles
//! them on the spot (interrupt, beep, volume) or queues them for a worker lane.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::worker::{AudioReady, AudioWork, Job, KeypadWork, send_reply};
use crate::audio::{AudioHandle, BeepSet};
use crate::protocol::{
    AudioRequest, ConfigCommand, KeyReport, KeypadRequest, Packet, PacketKind, PacketReader,
    ReadEvent, Status,
};
use crate::queue::BoundedQueue;
use crate::transport::{Channel, PacketWriter};

/// Routes decoded requests to their handler or lane
pub struct Dispatcher {
    pub audio_jobs: Arc<BoundedQueue<Job<AudioWork>>>,
    pub keypad_jobs: Arc<BoundedQueue<Job<KeypadWork>>>,
    pub handle: AudioHandle,
    pub beeps: BeepSet,
    pub audio_ready: AudioReady,
}

impl Dispatcher {
    /// Handle one inbound packet, replying on `reply`
    pub fn dispatch(&self, packet: &Packet, reply: &PacketWriter) {
        match packet.kind() {
            PacketKind::Keypad => self.on_keypad(packet, reply),
            PacketKind::Audio => self.on_audio(packet, reply),
            PacketKind::Config => self.on_config(packet, reply),
            PacketKind::Serial => {
                tracing::debug!(
                    tag = packet.tag(),
                    len = packet.payload().len(),
                    "ignoring serial packet"
                );
            }
        }
    }

    fn on_keypad(&self, packet: &Packet, reply: &PacketWriter) {
        let tag = packet.tag();
        match KeypadRequest::parse(packet.payload()) {
            Ok(KeypadRequest::Read) => {
                let job = Job {
                    tag,
                    generation: self.handle.generation(),
                    work: KeypadWork::Read,
                    reply: reply.clone(),
                };
                self.queue_keypad(job);
            }
            Err(e) => {
                tracing::warn!(tag, error = %e, "bad keypad request");
                send_reply(reply, PacketKind::Keypad, tag, &KeyReport::NONE.encode());
            }
        }
    }

    fn on_audio(&self, packet: &Packet, reply: &PacketWriter) {
        let tag = packet.tag();
        let request = match AudioRequest::parse(packet.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(tag, error = %e, "bad audio request");
                send_reply(reply, PacketKind::Audio, tag, &Status::Failed.encode());
                return;
            }
        };

        let work = match request {
            AudioRequest::Interrupt => {
                self.interrupt();
                send_reply(reply, PacketKind::Audio, tag, &Status::Ok.encode());
                return;
            }
            AudioRequest::Beep(kind) => {
                let status = if self.audio_ready.load(Ordering::Acquire) {
                    self.handle.play_beep(self.beeps.get(kind));
                    Status::Ok
                } else {
                    Status::Failed
                };
                send_reply(reply, PacketKind::Audio, tag, &status.encode());
                return;
            }
            AudioRequest::Speak(text) => AudioWork::Speak(text),
            AudioRequest::PlayFile(path) => AudioWork::PlayFile(path),
            AudioRequest::Persist(text) => AudioWork::Persist(text),
        };

        self.queue_audio(tag, work, reply);
    }

    fn on_config(&self, packet: &Packet, reply: &PacketWriter) {
        let tag = packet.tag();
        match ConfigCommand::parse(packet.payload()) {
            Ok(ConfigCommand::SetVolume(percent)) => {
                self.handle.set_volume(percent);
                tracing::info!(percent, "volume set");
                send_reply(reply, PacketKind::Config, tag, &Status::Ok.encode());
            }
            Ok(ConfigCommand::SetSpeechSpeed(percent)) => {
                self.queue_audio(tag, AudioWork::SetSpeed(percent), reply);
            }
            Ok(ConfigCommand::SetLayout(layout)) => {
                let job = Job {
                    tag,
                    generation: self.handle.generation(),
                    work: KeypadWork::SetLayout(layout),
                    reply: reply.clone(),
                };
                self.queue_keypad(job);
            }
            Err(e) => {
                tracing::warn!(tag, error = %e, "bad config request");
                send_reply(reply, PacketKind::Config, tag, &Status::Failed.encode());
            }
        }
    }

    fn queue_keypad(&self, job: Job<KeypadWork>) {
        let Some(dropped) = self.keypad_jobs.push(job) else {
            return;
        };
        match dropped.work {
            KeypadWork::Read => {
                send_reply(
                    &dropped.reply,
                    PacketKind::Keypad,
                    dropped.tag,
                    &KeyReport::NONE.encode(),
                );
            }
            KeypadWork::SetLayout(_) => {
                dropped.reply_status(PacketKind::Config, Status::Interrupted);
            }
        }
    }

    fn queue_audio(&self, tag: u16, work: AudioWork, reply: &PacketWriter) {
        let job = Job {
            tag,
            generation: self.handle.generation(),
            work,
            reply: reply.clone(),
        };
        if let Some(dropped) = self.audio_jobs.push(job) {
            dropped.reply_status(dropped.work.reply_kind(), Status::Interrupted);
        }
    }

    /// Silence playback and cancel every queued playback job
    ///
    /// Settings changes waiting in the lane are kept.
    pub fn interrupt(&self) {
        let generation = self.handle.interrupt();

        let mut cancelled = 0usize;
        let mut kept = Vec::new();
        for job in self.audio_jobs.drain() {
            if job.work.is_playback() {
                job.reply_status(PacketKind::Audio, Status::Interrupted);
                cancelled += 1;
            } else {
                kept.push(job);
            }
        }
        for job in kept {
            if let Some(dropped) = self.audio_jobs.push(job) {
                dropped.reply_status(dropped.work.reply_kind(), Status::Interrupted);
            }
        }

        tracing::debug!(generation, cancelled, "interrupt handled");
    }

    /// Close both lanes; workers exit once idle
    pub fn close(&self) {
        self.audio_jobs.close();
        self.keypad_jobs.close();
    }
}

/// Read packets from one channel until the peer goes away
pub fn pump(
    channel: Channel,
    mut reader: PacketReader<std::os::unix::net::UnixStream>,
    reply: &PacketWriter,
    dispatcher: &Dispatcher,
) {
    tracing::debug!(%channel, "reader started");
    loop {
        match reader.read_packet() {
            Ok(ReadEvent::Packet(packet)) => dispatcher.dispatch(&packet, reply),
            Ok(ReadEvent::Idle) => {}
            Ok(ReadEvent::Closed) => {
                tracing::info!(%channel, "peer closed channel");
                break;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(%channel, error = %e, "discarded bad packet");
            }
            Err(e) => {
                tracing::error!(%channel, error = %e, "channel read failed");
                break;
            }
        }
    }
}
