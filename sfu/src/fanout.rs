use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use webrtc::rtcp;
use webrtc::rtcp::sender_report::SenderReport;
use webrtc::rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use webrtc::rtp;
use webrtc::util::Unmarshal;

use crate::{ControllerHandle, IncomingTrack, MediaSession, PacketRing, RelaySink, RemoteMedia, TrackKind};

const AUDIO_BUFFER: usize = 32 * 1024;
const VIDEO_BUFFER: usize = 256 * 1024;

// How often the ring is polled for a missing-packet report.
const NACK_INTERVAL: Duration = Duration::from_millis(20);

const PACKET_QUEUE: usize = 4;
const RTCP_QUEUE: usize = 24;

type RtcpBatch = Vec<Box<dyn rtcp::packet::Packet + Send + Sync>>;

/// Start the per-track forwarding path: read RTP from the remote source,
/// feed the packet ring, relay to the fan-out sink, and convert gap reports
/// into NACKs toward the source. Terminates on any read error, removing the
/// track from the whole node.
pub(crate) fn spawn(
	track: IncomingTrack,
	remote: Arc<dyn RemoteMedia>,
	session: Arc<dyn MediaSession>,
	controller: ControllerHandle,
) {
	tokio::spawn(run(track, remote, session, controller));
}

async fn run(
	track: IncomingTrack,
	remote: Arc<dyn RemoteMedia>,
	session: Arc<dyn MediaSession>,
	controller: ControllerHandle,
) {
	let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
	let (rtcp_tx, rtcp_rx) = mpsc::channel::<RtcpBatch>(RTCP_QUEUE);

	let telemetry = tokio::spawn(read_rtcp(remote.clone()));

	// NACKs go through a serialization queue so ticker and future writers
	// never interleave on the session.
	let writer = tokio::spawn(write_rtcp(session, rtcp_rx));

	let analyze = tokio::spawn(analyze(
		track.relay.clone(),
		remote.ssrc(),
		remote.rtx_ssrc(),
		packet_rx,
		rtcp_tx,
	));

	let mut buf = vec![
		0u8;
		match remote.kind() {
			TrackKind::Video => VIDEO_BUFFER,
			_ => AUDIO_BUFFER,
		}
	];

	loop {
		let len = match remote.read(&mut buf).await {
			Ok(len) => len,
			Err(err) => {
				tracing::debug!(track = %track, ?err, "rtp read ended");
				break;
			}
		};

		let mut raw = &buf[..len];
		let mut packet = match rtp::packet::Packet::unmarshal(&mut raw) {
			Ok(packet) => packet,
			Err(err) => {
				tracing::error!(track = %track, ?err, "failed to unmarshal rtp");
				break;
			}
		};

		// Header extensions are transport-hop local; strip before relaying.
		packet.header.extension = false;
		packet.header.extension_profile = 0;
		packet.header.extensions.clear();

		if packet_tx.send(packet).await.is_err() {
			break;
		}
	}

	// Closing the packet queue winds down the analyzer, which in turn closes
	// the RTCP queue and the writer.
	drop(packet_tx);
	telemetry.abort();
	let _ = analyze.await;
	let _ = writer.await;

	controller.remove_track(&track);
}

async fn analyze(
	relay: RelaySink,
	media_ssrc: u32,
	rtx_ssrc: Option<u32>,
	mut packets: mpsc::Receiver<rtp::packet::Packet>,
	nacks: mpsc::Sender<RtcpBatch>,
) {
	let mut ring = PacketRing::new();
	let mut ticker = tokio::time::interval(NACK_INTERVAL);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			packet = packets.recv() => {
				let Some(packet) = packet else { return };

				ring.insert(packet.clone());

				if let Err(err) = relay.write_rtp(&packet).await {
					tracing::error!(?err, "error writing rtp to relay");
					return;
				}
			}
			_ = ticker.tick() => {
				let missing = ring.missing();
				if missing.is_empty() {
					continue;
				}

				let missing: Vec<u16> = missing.into_iter().map(|ext| (ext & 0xFFFF) as u16).collect();
				let nack = TransportLayerNack {
					sender_ssrc: rtx_ssrc.unwrap_or(0),
					media_ssrc,
					nacks: nack_pairs(&missing),
				};

				if nacks.send(vec![Box::new(nack)]).await.is_err() {
					return;
				}
			}
		}
	}
}

async fn write_rtcp(session: Arc<dyn MediaSession>, mut batches: mpsc::Receiver<RtcpBatch>) {
	while let Some(batch) = batches.recv().await {
		if let Err(err) = session.write_rtcp(&batch).await {
			tracing::warn!(?err, "error writing rtcp");
		}
	}
}

// Consume RTCP from the source for telemetry.
async fn read_rtcp(remote: Arc<dyn RemoteMedia>) {
	let mut last_report: Option<Instant> = None;

	loop {
		let packets = match remote.read_rtcp().await {
			Ok(packets) => packets,
			Err(_) => return,
		};

		for packet in packets {
			if let Some(report) = packet.as_any().downcast_ref::<SenderReport>() {
				let now = Instant::now();
				if let Some(previous) = last_report {
					tracing::trace!(ssrc = report.ssrc, since = ?(now - previous), "sender report");
				}
				last_report = Some(now);
			}
		}
	}
}

/// Group 16-bit sequence numbers into RFC 4585 NACK pairs: a packet id plus
/// a bitmask covering the following 16 sequence numbers.
pub fn nack_pairs(missing: &[u16]) -> Vec<NackPair> {
	let mut pairs: Vec<NackPair> = Vec::new();

	for &seq in missing {
		if let Some(last) = pairs.last_mut() {
			let delta = seq.wrapping_sub(last.packet_id);
			if delta > 0 && delta <= 16 {
				last.lost_packets |= 1 << (delta - 1);
				continue;
			}
		}

		pairs.push(NackPair {
			packet_id: seq,
			lost_packets: 0,
		});
	}

	pairs
}
