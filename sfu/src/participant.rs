use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Duration;
use url::Url;

use crate::actor::{self, Actor, Mailbox, Tagged};
use crate::{
	fanout, ControllerHandle, IncomingTrack, MediaSender, MediaSession, Member, MidMapping, OutgoingTrack,
	ParticipantStatus, RelaySink, RemoteMedia, Result, SenderStatus, SessionEvent, SessionEventSink, SessionFactory,
	Signal, SignalConnection, SignalDialer, SignalSink, SignalStream, StagedTrackStatus, TrackDescriptor, TrackKind,
	TransceiverDirection,
};

const MAILBOX_CAPACITY: usize = 1024;

// Backoff when a state evaluation observes an unstable precondition.
const EVAL_RETRY: Duration = Duration::from_millis(300);

// Settling delay after the outgoing track set changes.
const TRACK_CHANGE_DELAY: Duration = Duration::from_millis(500);

// At most one keyframe burst per gate window; a periodic tick keeps
// long-lived tracks refreshed.
const KEYFRAME_GATE: Duration = Duration::from_millis(500);
const KEYFRAME_TICK: Duration = Duration::from_secs(3);

const TRUNK_REDIAL: Duration = Duration::from_secs(10);

/// Opaque identity of a participant, used by the controller to address and
/// remove it without holding any shared state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ParticipantId(u64);

impl ParticipantId {
	pub(crate) fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

/// Messages consumed by the participant actor.
pub enum ParticipantEvent {
	/// Write a signalling frame to the peer.
	SendSignal(Signal),
	/// A signalling frame arrived from the peer.
	HandleSignal(Signal),
	Stop,
	/// The controller routes a new relayed track toward this participant.
	AddOutgoing(IncomingTrack),
	/// The source of an outgoing track is gone.
	RemoveOutgoing(String),
	KeyframeTick,
	KeyframeUnlock,
	/// Reconcile outgoing-track intent with session reality.
	EvalState,
	/// Establish the signalling channel (trunk participants only).
	Dial,
	/// The transport delivered an inbound media stream.
	TrackReceived(Arc<dyn RemoteMedia>),
	/// A media session changed connection state.
	SessionChanged { terminal: bool },
	/// The outbound session settled back to stable.
	OutboundStable,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ParticipantTag {
	SendSignal,
	HandleSignal,
	Stop,
	AddOutgoing,
	RemoveOutgoing,
	KeyframeTick,
	KeyframeUnlock,
	EvalState,
	Dial,
	TrackReceived,
	SessionChanged,
	OutboundStable,
}

impl Tagged for ParticipantEvent {
	type Tag = ParticipantTag;

	fn tag(&self) -> ParticipantTag {
		match self {
			Self::SendSignal(_) => ParticipantTag::SendSignal,
			Self::HandleSignal(_) => ParticipantTag::HandleSignal,
			Self::Stop => ParticipantTag::Stop,
			Self::AddOutgoing(_) => ParticipantTag::AddOutgoing,
			Self::RemoveOutgoing(_) => ParticipantTag::RemoveOutgoing,
			Self::KeyframeTick => ParticipantTag::KeyframeTick,
			Self::KeyframeUnlock => ParticipantTag::KeyframeUnlock,
			Self::EvalState => ParticipantTag::EvalState,
			Self::Dial => ParticipantTag::Dial,
			Self::TrackReceived(_) => ParticipantTag::TrackReceived,
			Self::SessionChanged { .. } => ParticipantTag::SessionChanged,
			Self::OutboundStable => ParticipantTag::OutboundStable,
		}
	}
}

/// Cloneable address of a participant actor.
#[derive(Clone)]
pub struct ParticipantHandle {
	id: ParticipantId,
	label: String,
	trunk_url: Option<String>,
	mailbox: Mailbox<ParticipantEvent>,
}

impl ParticipantHandle {
	pub fn id(&self) -> ParticipantId {
		self.id
	}

	pub fn label(&self) -> &str {
		&self.label
	}

	pub fn trunk_url(&self) -> Option<&str> {
		self.trunk_url.as_deref()
	}

	/// Flush pending work and ask the actor to terminate.
	pub fn stop(&self) {
		self.mailbox.clear();
		self.mailbox.send(ParticipantEvent::Stop).ok();
	}

	pub fn add_outgoing(&self, track: &IncomingTrack) {
		self.mailbox.send(ParticipantEvent::AddOutgoing(track.clone())).ok();
	}

	pub fn remove_outgoing(&self, umbrella_id: &str) {
		self.mailbox
			.send(ParticipantEvent::RemoveOutgoing(umbrella_id.to_string()))
			.ok();
	}

	pub fn request_eval(&self) {
		self.mailbox.send(ParticipantEvent::EvalState).ok();
	}
}

// A track we expect to receive: announced first, attached once the mid
// binding and the raw media stream have both arrived.
struct IncomingSlot {
	descriptor: TrackDescriptor,
	attached: Option<IncomingTrack>,
}

/// Per-participant actor: owns two media sessions, exchanges signalling with
/// one remote peer, keeps the peer informed about tracks to be sent, and
/// accepts tracks to be received.
pub struct Participant {
	id: ParticipantId,
	label: String,
	trunk_url: Option<Url>,

	mailbox: Mailbox<ParticipantEvent>,
	controller: ControllerHandle,

	inbound: Arc<dyn MediaSession>,
	outbound: Arc<dyn MediaSession>,

	signal: Option<Box<dyn SignalSink>>,
	dialer: Option<Arc<dyn SignalDialer>>,

	// All four maps are keyed by umbrella id.
	incoming: HashMap<String, IncomingSlot>,
	outgoing: HashMap<String, OutgoingTrack>,
	senders: HashMap<String, Arc<dyn MediaSender>>,
	mids: HashMap<String, String>,

	// Inbound raw tracks waiting for their mid binding.
	staged: Vec<Arc<dyn RemoteMedia>>,

	keyframe_gate: bool,
	// Set when the outgoing set shrinks, so the peer learns about removals.
	needs_advertise: bool,
	// The outbound session has sent at least one offer.
	negotiated: bool,
}

fn event_sink(mailbox: Mailbox<ParticipantEvent>, controller: ControllerHandle, outbound: bool) -> SessionEventSink {
	Arc::new(move |event| match event {
		SessionEvent::Candidate(candidate) => {
			// The flag describes the candidate from OUR perspective; the
			// receiving side inverts it.
			let signal = Signal::IceCandidate {
				candidate,
				incoming: !outbound,
			};
			mailbox.send(ParticipantEvent::SendSignal(signal)).ok();
		}
		SessionEvent::ConnectionChanged { terminal } => {
			mailbox.send(ParticipantEvent::SessionChanged { terminal }).ok();
			controller.signal_all();
		}
		SessionEvent::SignalingStable => {
			if outbound {
				mailbox.send(ParticipantEvent::OutboundStable).ok();
			}
		}
		SessionEvent::NegotiationNeeded => {
			mailbox.send(ParticipantEvent::EvalState).ok();
		}
		SessionEvent::TrackReceived(remote) => {
			if !outbound {
				mailbox.send(ParticipantEvent::TrackReceived(remote)).ok();
			}
		}
	})
}

fn spawn_reader(mut stream: Box<dyn SignalStream>, mailbox: Mailbox<ParticipantEvent>) {
	tokio::spawn(async move {
		loop {
			match stream.recv().await {
				Ok(Some(frame)) => match Signal::from_frame(&frame) {
					Ok(signal) => {
						if mailbox.send(ParticipantEvent::HandleSignal(signal)).is_err() {
							return;
						}
					}
					// Protocol violation: drop the frame, keep the session.
					Err(err) => tracing::warn!(?err, "ignoring malformed signalling frame"),
				},
				Ok(None) | Err(_) => {
					mailbox.clear();
					mailbox.send(ParticipantEvent::Stop).ok();
					return;
				}
			}
		}
	});
}

impl Participant {
	/// Run a participant for an accepted signalling connection (a browser
	/// client or an inbound peer node).
	pub async fn accept(
		label: &str,
		connection: SignalConnection,
		controller: ControllerHandle,
		factory: Arc<dyn SessionFactory>,
	) -> Result<ParticipantHandle> {
		let handle = Self::start(label.to_string(), None, Some(connection), None, controller.clone(), factory).await?;

		controller.add_participant(Member::Browser(handle.clone()));
		controller.signal_all();

		Ok(handle)
	}

	/// Run an outbound trunk participant that dials a peer node itself.
	pub async fn trunk(
		url: Url,
		controller: ControllerHandle,
		factory: Arc<dyn SessionFactory>,
		dialer: Option<Arc<dyn SignalDialer>>,
	) -> Result<ParticipantHandle> {
		let label = format!("trunk to {url}");
		Self::start(label, Some(url), None, dialer, controller, factory).await
	}

	async fn start(
		label: String,
		trunk_url: Option<Url>,
		connection: Option<SignalConnection>,
		dialer: Option<Arc<dyn SignalDialer>>,
		controller: ControllerHandle,
		factory: Arc<dyn SessionFactory>,
	) -> Result<ParticipantHandle> {
		let id = ParticipantId::next();
		let mailbox = Mailbox::new(&label, MAILBOX_CAPACITY);

		let inbound = factory
			.create(
				&format!("incoming for {label}"),
				event_sink(mailbox.clone(), controller.clone(), false),
			)
			.await?;
		let outbound = factory
			.create(
				&format!("outgoing for {label}"),
				event_sink(mailbox.clone(), controller.clone(), true),
			)
			.await?;

		// Unordered data channels keep the transports alive without media.
		inbound.create_data_channel("data-out").await?;
		outbound.create_data_channel("data-in").await?;

		// The first offer must carry a media section even before any track
		// is bound, so the outbound session starts with a placeholder.
		outbound
			.add_transceiver(TrackKind::Audio, TransceiverDirection::SendOnly)
			.await?;

		let signal = connection.map(|connection| {
			spawn_reader(connection.stream, mailbox.clone());
			connection.sink
		});

		let handle = ParticipantHandle {
			id,
			label: label.clone(),
			trunk_url: trunk_url.as_ref().map(|url| url.to_string()),
			mailbox: mailbox.clone(),
		};

		let dial = signal.is_none() && trunk_url.is_some();

		let participant = Participant {
			id,
			label,
			trunk_url,
			mailbox: mailbox.clone(),
			controller,
			inbound,
			outbound,
			signal,
			dialer,
			incoming: HashMap::new(),
			outgoing: HashMap::new(),
			senders: HashMap::new(),
			mids: HashMap::new(),
			staged: Vec::new(),
			keyframe_gate: false,
			needs_advertise: false,
			negotiated: false,
		};

		actor::spawn(mailbox.clone(), participant);

		if dial {
			mailbox.send(ParticipantEvent::Dial).ok();
		}

		Ok(handle)
	}

	fn handle(&self) -> ParticipantHandle {
		ParticipantHandle {
			id: self.id,
			label: self.label.clone(),
			trunk_url: self.trunk_url.as_ref().map(|url| url.to_string()),
			mailbox: self.mailbox.clone(),
		}
	}

	fn stop(&mut self) {
		tracing::info!(label = %self.label, "stopping");
		self.mailbox.abort();
	}

	fn defer_eval(&self) {
		self.mailbox.cancel(ParticipantTag::EvalState);
		self.mailbox.send_in(ParticipantEvent::EvalState, EVAL_RETRY).ok();
	}

	fn schedule_eval_after_track_change(&self) {
		self.mailbox.cancel(ParticipantTag::EvalState);
		self.mailbox.send_in(ParticipantEvent::EvalState, TRACK_CHANGE_DELAY).ok();
	}

	async fn send_signal(&mut self, signal: Signal) {
		let Some(sink) = self.signal.as_mut() else {
			tracing::error!(label = %self.label, "attempting to send with no signalling channel");
			return;
		};

		if let Err(err) = sink.send(signal.to_frame()).await {
			tracing::error!(label = %self.label, ?err, "failed to write signalling frame");
			self.stop();
		}
	}

	async fn handle_signal(&mut self, signal: Signal) {
		match signal {
			Signal::IceCandidate { candidate, incoming } => {
				// `incoming` is from the sender's perspective: their inbound
				// session pairs with our outbound one.
				let session = if incoming { &self.outbound } else { &self.inbound };
				if let Err(err) = session.add_ice_candidate(&candidate).await {
					tracing::error!(label = %self.label, ?err, "failed to add ice candidate");
				}
			}
			Signal::Answer { sdp } => {
				if let Err(err) = self.outbound.set_remote_description(&sdp).await {
					tracing::error!(label = %self.label, ?err, "failed to apply answer");
				}
			}
			Signal::Offer { sdp } => self.handle_offer(sdp).await,
			Signal::AcceptTracks { tracks } => {
				// The peer confirmed it expects these tracks.
				for descriptor in tracks {
					if let Some(outgoing) = self.outgoing.get_mut(&descriptor.umbrella_id) {
						outgoing.advertised = true;
						outgoing.accepted = true;
					}
				}

				self.mailbox.send(ParticipantEvent::EvalState).ok();
			}
			Signal::UpstreamTracks { tracks } => self.handle_upstream_tracks(tracks).await,
			Signal::MidMappings { mappings } => {
				for mapping in mappings {
					self.mids.insert(mapping.mid, mapping.umbrella_id);
				}

				self.eval_incoming();
			}
		}
	}

	async fn handle_offer(&mut self, sdp: String) {
		if let Err(err) = self.inbound.set_remote_description(&sdp).await {
			tracing::error!(label = %self.label, ?err, "failed to apply offer");
			return;
		}

		let answer = match self.inbound.create_answer().await {
			Ok(answer) => answer,
			Err(err) => {
				tracing::error!(label = %self.label, ?err, "failed to create answer");
				return;
			}
		};

		// Trickle ICE: the answer goes out immediately, candidates follow.
		if let Err(err) = self.inbound.set_local_description(&answer).await {
			tracing::error!(label = %self.label, ?err, "failed to set local answer");
			return;
		}

		self.send_signal(Signal::Answer { sdp: answer }).await;
	}

	async fn handle_upstream_tracks(&mut self, tracks: Vec<TrackDescriptor>) {
		// Any previously unknown upstream track needs a transceiver, then we
		// acknowledge with the complete set of expected tracks.
		for descriptor in tracks {
			if self.incoming.contains_key(&descriptor.umbrella_id) || descriptor.kind == TrackKind::Unknown {
				continue;
			}

			match self
				.inbound
				.add_transceiver(descriptor.kind, TransceiverDirection::RecvOnly)
				.await
			{
				Ok(()) => {
					tracing::info!(label = %self.label, umbrella_id = %descriptor.umbrella_id, "expecting upstream track");
					self.incoming.insert(
						descriptor.umbrella_id.clone(),
						IncomingSlot {
							descriptor,
							attached: None,
						},
					);
				}
				Err(err) => tracing::error!(label = %self.label, ?err, "failed to add transceiver"),
			}
		}

		let accepted = self.incoming.values().map(|slot| slot.descriptor.clone()).collect();
		self.send_signal(Signal::AcceptTracks { tracks: accepted }).await;

		self.controller.signal_all();
	}

	/// Resolve staged inbound tracks whose mid binding has become known.
	/// Idempotent and safe under any arrival order of the raw track and the
	/// mapping.
	fn eval_incoming(&mut self) {
		let mut index = 0;
		while index < self.staged.len() {
			let staged = &self.staged[index];

			let Some(mid) = staged.mid() else {
				index += 1;
				continue;
			};
			let Some(umbrella_id) = self.mids.get(&mid) else {
				index += 1;
				continue;
			};
			let Some(slot) = self.incoming.get_mut(umbrella_id) else {
				index += 1;
				continue;
			};
			if slot.attached.is_some() {
				index += 1;
				continue;
			}

			let remote = self.staged.remove(index);

			let mut descriptor = slot.descriptor.clone();
			descriptor.id = remote.id();
			descriptor.stream_id = remote.stream_id();

			let relay = RelaySink::new(
				remote.codec(),
				format!("UMB_RELAY{}", uuid::Uuid::new_v4()),
				remote.stream_id(),
			);

			let track = IncomingTrack {
				descriptor: descriptor.clone(),
				relay,
			};

			slot.descriptor = descriptor;
			slot.attached = Some(track.clone());

			tracing::info!(label = %self.label, umbrella_id = %track.umbrella_id(), "fanning out incoming track");

			fanout::spawn(track.clone(), remote, self.inbound.clone(), self.controller.clone());
			self.controller.add_track(track);
		}
	}

	/// Reconcile outgoing-track intent with the outbound session, deferring
	/// whenever a precondition is not yet stable.
	async fn eval_state(&mut self) {
		// The peer must know the full outgoing set before anything else.
		if self.needs_advertise || self.outgoing.values().any(|outgoing| !outgoing.advertised) {
			let mut tracks = Vec::new();
			for outgoing in self.outgoing.values_mut() {
				outgoing.advertised = true;
				tracks.push(outgoing.source.descriptor.clone());
			}
			self.needs_advertise = false;

			self.send_signal(Signal::UpstreamTracks { tracks }).await;
			self.defer_eval();
			return;
		}

		// Wait for the peer to confirm it expects every track.
		if self.outgoing.values().any(|outgoing| !outgoing.accepted) {
			self.defer_eval();
			return;
		}

		if !self.outbound.signaling_stable() {
			self.defer_eval();
			return;
		}

		// Drop senders whose track is no longer outgoing.
		let mut failed = false;
		let mut changed = false;

		let stale: Vec<String> = self
			.senders
			.keys()
			.filter(|umbrella_id| !self.outgoing.contains_key(*umbrella_id))
			.cloned()
			.collect();

		for umbrella_id in stale {
			tracing::debug!(label = %self.label, %umbrella_id, "removing sender");

			let Some(sender) = self.senders.get(&umbrella_id).cloned() else {
				continue;
			};
			match self.outbound.remove_sender(&sender).await {
				Ok(()) => {
					self.senders.remove(&umbrella_id);
					changed = true;
				}
				Err(err) => {
					tracing::error!(label = %self.label, %umbrella_id, ?err, "failed to remove sender");
					failed = true;
				}
			}
		}

		if failed {
			self.defer_eval();
			return;
		}

		// Bind a sender for every outgoing track that lacks a live one.
		for (umbrella_id, outgoing) in &self.outgoing {
			let missing = match self.senders.get(umbrella_id) {
				Some(sender) => !sender.has_track().await,
				None => true,
			};
			if !missing {
				continue;
			}

			tracing::debug!(label = %self.label, %umbrella_id, "creating sender");

			match self.outbound.add_sender(&outgoing.source.relay).await {
				Ok(sender) => {
					self.senders.insert(umbrella_id.clone(), sender);
					changed = true;
				}
				Err(err) => {
					tracing::error!(label = %self.label, %umbrella_id, ?err, "failed to create sender");
					failed = true;
				}
			}
		}

		if failed {
			self.defer_eval();
			return;
		}

		if !changed && self.negotiated {
			// Already satisfied; renegotiating now would only churn the peer.
			return;
		}

		let offer = match self.outbound.create_offer().await {
			Ok(offer) => offer,
			Err(err) => {
				tracing::error!(label = %self.label, ?err, "failed to create offer");
				self.defer_eval();
				return;
			}
		};

		if let Err(err) = self.outbound.set_local_description(&offer).await {
			tracing::error!(label = %self.label, ?err, "failed to set local offer");
			self.defer_eval();
			return;
		}

		self.negotiated = true;
		self.send_signal(Signal::Offer { sdp: offer }).await;
	}

	/// Once the outbound session settles, tell the peer which mid carries
	/// which umbrella id.
	async fn send_mid_mappings(&mut self) {
		let mut mappings = Vec::new();

		for umbrella_id in self.outgoing.keys() {
			let Some(sender) = self.senders.get(umbrella_id) else {
				continue;
			};
			if !sender.has_track().await {
				continue;
			}
			if let Some(mid) = self.outbound.sender_mid(sender).await {
				mappings.push(MidMapping {
					mid,
					umbrella_id: umbrella_id.clone(),
				});
			}
		}

		self.send_signal(Signal::MidMappings { mappings }).await;
	}

	async fn dial(&mut self) {
		if self.signal.is_some() {
			return;
		}

		let Some(url) = self.trunk_url.clone() else {
			return;
		};
		let Some(dialer) = self.dialer.clone() else {
			tracing::error!(label = %self.label, "no dialer configured for trunk");
			return;
		};

		match dialer.dial(&url).await {
			Ok(connection) => {
				spawn_reader(connection.stream, self.mailbox.clone());
				self.signal = Some(connection.sink);

				self.controller.add_participant(Member::Peer(Participant::handle(self)));
				self.controller.signal_all();
			}
			Err(err) => {
				tracing::warn!(label = %self.label, %url, ?err, "trunk dial failed, retrying");
				self.mailbox.send_in(ParticipantEvent::Dial, TRUNK_REDIAL).ok();
			}
		}
	}

	async fn keyframe_burst(&mut self) {
		if self.keyframe_gate {
			return;
		}

		self.mailbox.cancel(ParticipantTag::KeyframeTick);

		self.keyframe_gate = true;
		self.mailbox.send_in(ParticipantEvent::KeyframeUnlock, KEYFRAME_GATE).ok();

		self.inbound.request_keyframes().await;

		self.mailbox.send_in(ParticipantEvent::KeyframeTick, KEYFRAME_TICK).ok();
	}

	async fn publish_status(&self) {
		let mut senders = Vec::new();
		for (umbrella_id, sender) in &self.senders {
			senders.push(SenderStatus {
				umbrella_id: umbrella_id.clone(),
				has_track: sender.has_track().await,
				track_id: sender.track_id().await,
			});
		}

		let status = ParticipantStatus {
			label: self.label.clone(),
			trunk_url: self.trunk_url.as_ref().map(|url| url.to_string()),
			inbound: self.inbound.status().await,
			outbound: self.outbound.status().await,
			incoming_tracks: self.incoming.values().map(|slot| slot.descriptor.clone()).collect(),
			outgoing_tracks: self.outgoing.values().map(|t| t.source.descriptor.clone()).collect(),
			senders,
			mid_mappings: self
				.mids
				.iter()
				.map(|(mid, umbrella_id)| MidMapping {
					mid: mid.clone(),
					umbrella_id: umbrella_id.clone(),
				})
				.collect(),
			staged: self
				.staged
				.iter()
				.map(|remote| StagedTrackStatus {
					id: remote.id(),
					stream_id: remote.stream_id(),
					mid: remote.mid(),
				})
				.collect(),
		};

		self.controller.status_report(self.id, status);
	}
}

#[async_trait]
impl Actor for Participant {
	type Message = ParticipantEvent;

	async fn handle(&mut self, event: ParticipantEvent) {
		let mut eval = false;
		let mut keyframe = false;
		let mut report = true;

		match event {
			ParticipantEvent::KeyframeTick => {
				keyframe = true;
				report = false;
			}
			ParticipantEvent::KeyframeUnlock => {
				self.keyframe_gate = false;
				report = false;
			}
			ParticipantEvent::SendSignal(signal) => {
				self.send_signal(signal).await;
				report = false;
			}
			ParticipantEvent::HandleSignal(signal) => self.handle_signal(signal).await,
			ParticipantEvent::Stop => {
				self.stop();
				return;
			}
			ParticipantEvent::AddOutgoing(track) => {
				// Never loop a track back to the participant it came from.
				if self.incoming.contains_key(track.umbrella_id()) {
					return;
				}

				if !self.outgoing.contains_key(track.umbrella_id()) {
					self.outgoing
						.insert(track.umbrella_id().to_string(), OutgoingTrack::new(track));
					self.schedule_eval_after_track_change();
				}
			}
			ParticipantEvent::RemoveOutgoing(umbrella_id) => {
				if self.outgoing.remove(&umbrella_id).is_some() {
					self.needs_advertise = true;
					self.schedule_eval_after_track_change();
				}
			}
			ParticipantEvent::EvalState => {
				if self.inbound.is_terminated() || self.outbound.is_terminated() {
					self.stop();
					return;
				}

				eval = true;
			}
			ParticipantEvent::Dial => self.dial().await,
			ParticipantEvent::TrackReceived(remote) => {
				tracing::info!(
					label = %self.label,
					id = %remote.id(),
					stream = %remote.stream_id(),
					"staging incoming track"
				);
				self.staged.push(remote);
				self.eval_incoming();
			}
			ParticipantEvent::SessionChanged { terminal } => {
				if terminal {
					self.stop();
					return;
				}
			}
			ParticipantEvent::OutboundStable => self.send_mid_mappings().await,
		}

		if eval {
			self.mailbox.cancel(ParticipantTag::EvalState);
			keyframe = true;
			self.eval_state().await;
		}

		if keyframe {
			self.keyframe_burst().await;
		}

		if report {
			self.publish_status().await;
		}
	}

	async fn cleanup(&mut self) {
		for slot in self.incoming.values() {
			if let Some(track) = &slot.attached {
				self.controller.remove_track(track);
			}
		}

		if let Some(sink) = self.signal.as_mut() {
			sink.close().await;
		}

		if let Err(err) = self.outbound.close().await {
			tracing::debug!(label = %self.label, ?err, "error closing outbound session");
		}
		if let Err(err) = self.inbound.close().await {
			tracing::debug!(label = %self.label, ?err, "error closing inbound session");
		}

		self.controller.remove_participant(self.id);

		tracing::info!(label = %self.label, "cleanup finished");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use crate::actor::Tagged as _;
	use crate::controller::{ControllerEvent, ControllerTag};
	use crate::testutil::{signal_pipe, MockFactory, MockRemote, RemotePeer};
	use crate::{RelaySink, SessionEvent};

	use tokio::time::{Duration, Instant};

	fn test_controller() -> (ControllerHandle, Mailbox<ControllerEvent>) {
		let mailbox = Mailbox::new("controller", 256);
		(ControllerHandle::new(mailbox.clone()), mailbox)
	}

	fn video_track(umbrella_id: &str) -> IncomingTrack {
		IncomingTrack {
			descriptor: TrackDescriptor {
				umbrella_id: umbrella_id.to_string(),
				kind: TrackKind::Video,
				id: format!("{umbrella_id}-id"),
				stream_id: format!("{umbrella_id}-stream"),
			},
			relay: RelaySink::new(Default::default(), format!("{umbrella_id}-relay"), "test-stream"),
		}
	}

	struct Fixture {
		factory: Arc<MockFactory>,
		handle: ParticipantHandle,
		remote: RemotePeer,
		controller_mailbox: Mailbox<ControllerEvent>,
	}

	impl Fixture {
		async fn accept() -> Self {
			let factory = Arc::new(MockFactory::default());
			let (controller, controller_mailbox) = test_controller();
			let (connection, remote) = signal_pipe();

			let handle = Participant::accept("test client", connection, controller, factory.clone())
				.await
				.unwrap();

			Self {
				factory,
				handle,
				remote,
				controller_mailbox,
			}
		}

		fn inbound(&self) -> Arc<crate::testutil::MockSession> {
			self.factory.session(0).0
		}

		fn outbound(&self) -> Arc<crate::testutil::MockSession> {
			self.factory.session(1).0
		}

		fn controller_tags(&self) -> Vec<ControllerTag> {
			let mut tags = Vec::new();
			while let Some(event) = self.controller_mailbox.pop_due(Instant::now()) {
				tags.push(event.tag());
			}
			tags
		}

		fn controller_events(&self) -> Vec<ControllerEvent> {
			let mut events = Vec::new();
			while let Some(event) = self.controller_mailbox.pop_due(Instant::now()) {
				events.push(event);
			}
			events
		}

		/// Drive the participant through announce/accept for one track.
		async fn establish(&mut self, track: &IncomingTrack) {
			self.handle.add_outgoing(track);

			match self.remote.recv().await {
				Signal::UpstreamTracks { tracks } => {
					assert_eq!(tracks.len(), 1);
					assert_eq!(tracks[0].umbrella_id, track.umbrella_id());
					assert_eq!(tracks[0].kind, TrackKind::Video);
				}
				other => panic!("expected UpstreamTracks, got {other:?}"),
			}

			self.remote.send(&Signal::AcceptTracks {
				tracks: vec![track.descriptor.clone()],
			});

			match self.remote.recv().await {
				Signal::Offer { sdp } => assert_eq!(sdp, "offer-1"),
				other => panic!("expected Offer, got {other:?}"),
			}
		}
	}

	#[tokio::test(start_paused = true)]
	async fn new_track_is_announced_accepted_and_offered() {
		let mut fixture = Fixture::accept().await;

		fixture.establish(&video_track("V1")).await;

		let outbound = fixture.outbound();
		let state = outbound.lock();
		assert_eq!(state.senders.len(), 1);
		// Placeholder audio sender plus the bookkeeping channels.
		assert_eq!(state.transceivers, vec![(TrackKind::Audio, TransceiverDirection::SendOnly)]);
		assert_eq!(state.data_channels, vec!["data-in".to_string()]);
		assert_eq!(state.local_descriptions, vec!["offer-1".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn removed_track_is_unannounced_and_renegotiated() {
		let mut fixture = Fixture::accept().await;
		fixture.establish(&video_track("V1")).await;

		fixture.handle.remove_outgoing("V1");

		// The peer first learns the track is gone, then gets a new offer
		// with the sender removed.
		match fixture.remote.recv().await {
			Signal::UpstreamTracks { tracks } => assert!(tracks.is_empty()),
			other => panic!("expected empty UpstreamTracks, got {other:?}"),
		}

		match fixture.remote.recv().await {
			Signal::Offer { sdp } => assert_eq!(sdp, "offer-2"),
			other => panic!("expected Offer, got {other:?}"),
		}

		assert!(fixture.outbound().lock().senders.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn own_track_is_never_looped_back() {
		let mut fixture = Fixture::accept().await;

		// The peer publishes V1 to us...
		let descriptor = video_track("V1").descriptor;
		fixture.remote.send(&Signal::UpstreamTracks {
			tracks: vec![descriptor.clone()],
		});

		match fixture.remote.recv().await {
			Signal::AcceptTracks { tracks } => assert_eq!(tracks, vec![descriptor]),
			other => panic!("expected AcceptTracks, got {other:?}"),
		}

		// ...so routing the same umbrella id back must be ignored.
		fixture.handle.add_outgoing(&video_track("V1"));

		tokio::time::sleep(Duration::from_secs(2)).await;
		assert!(fixture.remote.try_recv().is_none());
		assert!(fixture.outbound().lock().senders.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn accept_tracks_echoes_every_expected_track() {
		let mut fixture = Fixture::accept().await;

		let audio = TrackDescriptor {
			umbrella_id: "A1".to_string(),
			kind: TrackKind::Audio,
			..Default::default()
		};
		let video = TrackDescriptor {
			umbrella_id: "V1".to_string(),
			kind: TrackKind::Video,
			..Default::default()
		};

		fixture.remote.send(&Signal::UpstreamTracks {
			tracks: vec![audio.clone(), video.clone()],
		});

		let Signal::AcceptTracks { mut tracks } = fixture.remote.recv().await else {
			panic!("expected AcceptTracks");
		};
		tracks.sort_by(|a, b| a.umbrella_id.cmp(&b.umbrella_id));
		assert_eq!(tracks, vec![audio.clone(), video.clone()]);

		// A later announcement is answered with the full expected set.
		let second = TrackDescriptor {
			umbrella_id: "V2".to_string(),
			kind: TrackKind::Video,
			..Default::default()
		};
		fixture.remote.send(&Signal::UpstreamTracks {
			tracks: vec![second.clone()],
		});

		let Signal::AcceptTracks { mut tracks } = fixture.remote.recv().await else {
			panic!("expected AcceptTracks");
		};
		tracks.sort_by(|a, b| a.umbrella_id.cmp(&b.umbrella_id));
		assert_eq!(tracks, vec![audio, video, second]);

		// One receive-only transceiver per known-kind announcement.
		let inbound = fixture.inbound();
		let state = inbound.lock();
		assert_eq!(
			state.transceivers,
			vec![
				(TrackKind::Audio, TransceiverDirection::RecvOnly),
				(TrackKind::Video, TransceiverDirection::RecvOnly),
				(TrackKind::Video, TransceiverDirection::RecvOnly),
			]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn satisfied_state_produces_no_signalling() {
		let mut fixture = Fixture::accept().await;
		fixture.establish(&video_track("V1")).await;

		fixture.handle.request_eval();

		tokio::time::sleep(Duration::from_secs(2)).await;
		assert!(fixture.remote.try_recv().is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn unstable_signalling_defers_evaluation() {
		let mut fixture = Fixture::accept().await;

		fixture.outbound().lock().unstable = true;

		let track = video_track("V1");
		fixture.handle.add_outgoing(&track);

		match fixture.remote.recv().await {
			Signal::UpstreamTracks { tracks } => assert_eq!(tracks.len(), 1),
			other => panic!("expected UpstreamTracks, got {other:?}"),
		}

		fixture.remote.send(&Signal::AcceptTracks {
			tracks: vec![track.descriptor.clone()],
		});

		// Stuck mid-negotiation: no offer while the session is unstable.
		tokio::time::sleep(Duration::from_secs(1)).await;
		assert!(fixture.remote.try_recv().is_none());
		assert!(fixture.outbound().lock().senders.is_empty());

		// The deferred re-evaluation picks it up once the session settles.
		fixture.outbound().lock().unstable = false;
		match fixture.remote.recv().await {
			Signal::Offer { sdp } => assert_eq!(sdp, "offer-1"),
			other => panic!("expected Offer, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_sender_is_retried() {
		let mut fixture = Fixture::accept().await;

		fixture.outbound().lock().fail_add_sender = true;

		let track = video_track("V1");
		fixture.handle.add_outgoing(&track);

		match fixture.remote.recv().await {
			Signal::UpstreamTracks { tracks } => assert_eq!(tracks.len(), 1),
			other => panic!("expected UpstreamTracks, got {other:?}"),
		}

		fixture.remote.send(&Signal::AcceptTracks {
			tracks: vec![track.descriptor.clone()],
		});

		tokio::time::sleep(Duration::from_secs(1)).await;
		assert!(fixture.remote.try_recv().is_none());

		fixture.outbound().lock().fail_add_sender = false;
		match fixture.remote.recv().await {
			Signal::Offer { sdp } => assert_eq!(sdp, "offer-1"),
			other => panic!("expected Offer, got {other:?}"),
		}

		assert_eq!(fixture.outbound().lock().senders.len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn offer_is_answered() {
		let mut fixture = Fixture::accept().await;

		fixture.remote.send(&Signal::Offer {
			sdp: "remote-offer".to_string(),
		});

		match fixture.remote.recv().await {
			Signal::Answer { sdp } => assert_eq!(sdp, "answer-1"),
			other => panic!("expected Answer, got {other:?}"),
		}

		let inbound = fixture.inbound();
		let state = inbound.lock();
		assert_eq!(state.remote_descriptions, vec!["remote-offer".to_string()]);
		assert_eq!(state.local_descriptions, vec!["answer-1".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn candidate_direction_is_inverted_on_receive() {
		let mut fixture = Fixture::accept().await;

		// The sender flags candidates for ITS inbound session, which pairs
		// with OUR outbound one.
		fixture.remote.send(&Signal::IceCandidate {
			candidate: "their-inbound".to_string(),
			incoming: true,
		});
		fixture.remote.send(&Signal::IceCandidate {
			candidate: "their-outbound".to_string(),
			incoming: false,
		});

		tokio::time::sleep(Duration::from_millis(10)).await;

		assert_eq!(fixture.outbound().lock().candidates, vec!["their-inbound".to_string()]);
		assert_eq!(fixture.inbound().lock().candidates, vec!["their-outbound".to_string()]);
	}

	#[tokio::test(start_paused = true)]
	async fn local_candidates_are_trickled_with_direction() {
		let mut fixture = Fixture::accept().await;

		let (_, inbound_sink) = fixture.factory.session(0);
		let (_, outbound_sink) = fixture.factory.session(1);

		inbound_sink(SessionEvent::Candidate("from-inbound".to_string()));
		assert_eq!(
			fixture.remote.recv().await,
			Signal::IceCandidate {
				candidate: "from-inbound".to_string(),
				incoming: true,
			}
		);

		outbound_sink(SessionEvent::Candidate("from-outbound".to_string()));
		assert_eq!(
			fixture.remote.recv().await,
			Signal::IceCandidate {
				candidate: "from-outbound".to_string(),
				incoming: false,
			}
		);
	}

	async fn staged_resolution(mapping_first: bool) {
		let mut fixture = Fixture::accept().await;

		let descriptor = video_track("V1").descriptor;
		fixture.remote.send(&Signal::UpstreamTracks {
			tracks: vec![descriptor],
		});
		let _accept = fixture.remote.recv().await;

		let mapping = Signal::MidMappings {
			mappings: vec![MidMapping {
				mid: "0".to_string(),
				umbrella_id: "V1".to_string(),
			}],
		};

		let (_, inbound_sink) = fixture.factory.session(0);
		let remote_track = MockRemote::video("cam0", Some("0"));

		// Resolution must work in either arrival order.
		if mapping_first {
			fixture.remote.send(&mapping);
			tokio::time::sleep(Duration::from_millis(10)).await;
			inbound_sink(SessionEvent::TrackReceived(remote_track));
		} else {
			inbound_sink(SessionEvent::TrackReceived(remote_track));
			tokio::time::sleep(Duration::from_millis(10)).await;
			fixture.remote.send(&mapping);
		}

		tokio::time::sleep(Duration::from_millis(10)).await;

		let added: Vec<IncomingTrack> = fixture
			.controller_events()
			.into_iter()
			.filter_map(|event| match event {
				ControllerEvent::AddTrack(track) => Some(track),
				_ => None,
			})
			.collect();

		assert_eq!(added.len(), 1);
		assert_eq!(added[0].umbrella_id(), "V1");
		// The transport-level ids were discovered during resolution.
		assert_eq!(added[0].descriptor.id, "cam0");
		assert_eq!(added[0].descriptor.stream_id, "cam0-stream");
	}

	#[tokio::test(start_paused = true)]
	async fn staged_track_resolves_after_mapping() {
		staged_resolution(true).await;
	}

	#[tokio::test(start_paused = true)]
	async fn staged_track_resolves_before_mapping() {
		staged_resolution(false).await;
	}

	#[tokio::test(start_paused = true)]
	async fn stable_outbound_session_reports_mid_mappings() {
		let mut fixture = Fixture::accept().await;
		fixture.establish(&video_track("V1")).await;

		let (_, outbound_sink) = fixture.factory.session(1);
		outbound_sink(SessionEvent::SignalingStable);

		match fixture.remote.recv().await {
			Signal::MidMappings { mappings } => {
				assert_eq!(mappings.len(), 1);
				assert_eq!(mappings[0].umbrella_id, "V1");
			}
			other => panic!("expected MidMappings, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn keyframe_bursts_are_gated() {
		let mut fixture = Fixture::accept().await;
		fixture.establish(&video_track("V1")).await;

		// Let the gate from the negotiation burst reopen.
		tokio::time::sleep(Duration::from_secs(1)).await;
		let baseline = fixture.inbound().lock().keyframe_requests;

		// Two evaluations inside one gate window yield a single burst.
		fixture.handle.request_eval();
		fixture.handle.request_eval();
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert_eq!(fixture.inbound().lock().keyframe_requests, baseline + 1);

		// The periodic tick fires after the gate reopens.
		tokio::time::sleep(Duration::from_secs(4)).await;
		assert!(fixture.inbound().lock().keyframe_requests >= baseline + 2);
	}

	#[tokio::test(start_paused = true)]
	async fn terminal_session_stops_the_participant() {
		let fixture = Fixture::accept().await;

		fixture.inbound().lock().terminated = true;
		fixture.handle.request_eval();

		tokio::time::sleep(Duration::from_millis(10)).await;

		assert!(fixture.inbound().lock().closed);
		assert!(fixture.outbound().lock().closed);
		assert!(fixture
			.controller_tags()
			.contains(&ControllerTag::RemoveParticipant));
	}

	#[tokio::test(start_paused = true)]
	async fn peer_hangup_cleans_up_published_tracks() {
		let mut fixture = Fixture::accept().await;

		// Get one incoming track attached.
		let descriptor = video_track("V1").descriptor;
		fixture.remote.send(&Signal::UpstreamTracks {
			tracks: vec![descriptor],
		});
		let _accept = fixture.remote.recv().await;

		let (_, inbound_sink) = fixture.factory.session(0);
		inbound_sink(SessionEvent::TrackReceived(MockRemote::video("cam0", Some("0"))));
		fixture.remote.send(&Signal::MidMappings {
			mappings: vec![MidMapping {
				mid: "0".to_string(),
				umbrella_id: "V1".to_string(),
			}],
		});
		tokio::time::sleep(Duration::from_millis(10)).await;

		fixture.remote.hang_up();
		tokio::time::sleep(Duration::from_millis(10)).await;

		let tags = fixture.controller_tags();
		assert!(tags.contains(&ControllerTag::RemoveTrack));
		assert!(tags.contains(&ControllerTag::RemoveParticipant));
		assert!(fixture.inbound().lock().closed);
	}

	#[tokio::test(start_paused = true)]
	async fn trunk_registers_once_dialed() {
		struct PipeDialer {
			connection: std::sync::Mutex<Option<SignalConnection>>,
		}

		#[async_trait]
		impl SignalDialer for PipeDialer {
			async fn dial(&self, _url: &Url) -> Result<SignalConnection> {
				Ok(self.connection.lock().unwrap().take().expect("dialed twice"))
			}
		}

		let factory = Arc::new(MockFactory::default());
		let (controller, controller_mailbox) = test_controller();
		let (connection, mut remote) = signal_pipe();

		let dialer = Arc::new(PipeDialer {
			connection: std::sync::Mutex::new(Some(connection)),
		});

		let url = Url::parse("ws://peer.example/signal").unwrap();
		let _handle = Participant::trunk(url, controller, factory.clone(), Some(dialer))
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(10)).await;

		let mut added = false;
		while let Some(event) = controller_mailbox.pop_due(Instant::now()) {
			if let ControllerEvent::AddParticipant(member) = event {
				assert!(matches!(member, Member::Peer(_)));
				assert_eq!(member.label(), "trunk to ws://peer.example/signal");
				added = true;
			}
		}
		assert!(added, "trunk must join the participant list after dialing");

		// The signalling channel is live end to end.
		fixture_offer(&mut remote).await;
	}

	async fn fixture_offer(remote: &mut RemotePeer) {
		remote.send(&Signal::Offer {
			sdp: "trunk-offer".to_string(),
		});

		match remote.recv().await {
			Signal::Answer { sdp } => assert_eq!(sdp, "answer-1"),
			other => panic!("expected Answer, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn malformed_frames_are_ignored() {
		let factory = Arc::new(MockFactory::default());
		let (controller, _controller_mailbox) = test_controller();
		let (connection, mut remote) = signal_pipe();

		let _handle = Participant::accept("test client", connection, controller, factory.clone())
			.await
			.unwrap();

		// Garbage, then a valid frame: the session must survive.
		remote.send_raw(bytes::Bytes::from_static(b"\x03\xff\xff\xff"));
		remote.send(&Signal::Offer {
			sdp: "after-garbage".to_string(),
		});

		match remote.recv().await {
			Signal::Answer { sdp } => assert_eq!(sdp, "answer-1"),
			other => panic!("expected Answer, got {other:?}"),
		}
	}
}
