use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use url::Url;

use crate::actor::{self, Actor, Mailbox, Tagged};
use crate::{
	CameraConnector, CameraHandle, CameraTrunk, Error, IncomingTrack, Participant, ParticipantHandle, ParticipantId,
	ParticipantStatus, Result, SessionFactory, SfuStatus, SignalConnection, SignalDialer,
};

const MAILBOX_CAPACITY: usize = 1024;

/// One supervised participant, dispatched over the shared capability set.
///
/// Cameras never receive outgoing tracks; everything else behaves like a
/// regular signalled participant.
pub enum Member {
	/// A client that connected to us (browser, or an inbound peer node).
	Browser(ParticipantHandle),
	/// An outbound signalled trunk to a peer node.
	Peer(ParticipantHandle),
	/// An RTSP camera ingest trunk.
	Camera(CameraHandle),
	#[cfg(test)]
	Scripted(crate::testutil::ScriptedMember),
}

impl Member {
	pub fn id(&self) -> ParticipantId {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.id(),
			Self::Camera(handle) => handle.id(),
			#[cfg(test)]
			Self::Scripted(member) => member.id(),
		}
	}

	pub fn label(&self) -> &str {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.label(),
			Self::Camera(handle) => handle.label(),
			#[cfg(test)]
			Self::Scripted(member) => member.label(),
		}
	}

	pub fn stop(&self) {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.stop(),
			Self::Camera(handle) => handle.stop(),
			#[cfg(test)]
			Self::Scripted(member) => member.stop(),
		}
	}

	pub fn add_outgoing(&self, track: &IncomingTrack) {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.add_outgoing(track),
			Self::Camera(_) => {}
			#[cfg(test)]
			Self::Scripted(member) => member.add_outgoing(track),
		}
	}

	pub fn remove_outgoing(&self, umbrella_id: &str) {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.remove_outgoing(umbrella_id),
			Self::Camera(_) => {}
			#[cfg(test)]
			Self::Scripted(member) => member.remove_outgoing(umbrella_id),
		}
	}

	pub fn request_eval(&self) {
		match self {
			Self::Browser(handle) | Self::Peer(handle) => handle.request_eval(),
			Self::Camera(_) => {}
			#[cfg(test)]
			Self::Scripted(member) => member.request_eval(),
		}
	}
}

pub(crate) enum ControllerEvent {
	AddParticipant(Member),
	RemoveParticipant(ParticipantId),
	AddTrack(IncomingTrack),
	RemoveTrack(String),
	SignalAll,
	StatusReport(ParticipantId, Box<ParticipantStatus>),
	GetStatus(oneshot::Sender<SfuStatus>),
	GetServers(oneshot::Sender<Vec<String>>),
	SetServers(Vec<String>, oneshot::Sender<Vec<String>>),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ControllerTag {
	AddParticipant,
	RemoveParticipant,
	AddTrack,
	RemoveTrack,
	SignalAll,
	StatusReport,
	GetStatus,
	GetServers,
	SetServers,
}

impl Tagged for ControllerEvent {
	type Tag = ControllerTag;

	fn tag(&self) -> ControllerTag {
		match self {
			Self::AddParticipant(_) => ControllerTag::AddParticipant,
			Self::RemoveParticipant(_) => ControllerTag::RemoveParticipant,
			Self::AddTrack(_) => ControllerTag::AddTrack,
			Self::RemoveTrack(_) => ControllerTag::RemoveTrack,
			Self::SignalAll => ControllerTag::SignalAll,
			Self::StatusReport(..) => ControllerTag::StatusReport,
			Self::GetStatus(_) => ControllerTag::GetStatus,
			Self::GetServers(_) => ControllerTag::GetServers,
			Self::SetServers(..) => ControllerTag::SetServers,
		}
	}
}

/// Cloneable address of the controller actor. Participants hold one of
/// these; the controller holds participant handles, never the reverse.
#[derive(Clone)]
pub struct ControllerHandle {
	mailbox: Mailbox<ControllerEvent>,
}

impl ControllerHandle {
	pub(crate) fn new(mailbox: Mailbox<ControllerEvent>) -> Self {
		Self { mailbox }
	}

	pub fn add_participant(&self, member: Member) {
		self.mailbox.send(ControllerEvent::AddParticipant(member)).ok();
	}

	pub fn remove_participant(&self, id: ParticipantId) {
		self.mailbox.send(ControllerEvent::RemoveParticipant(id)).ok();
	}

	/// Register a track for relaying to every other participant.
	pub fn add_track(&self, track: IncomingTrack) {
		self.mailbox.send(ControllerEvent::AddTrack(track)).ok();
	}

	pub fn remove_track(&self, track: &IncomingTrack) {
		self.mailbox
			.send(ControllerEvent::RemoveTrack(track.umbrella_id().to_string()))
			.ok();
	}

	/// Ask every participant to re-evaluate its state.
	pub fn signal_all(&self) {
		self.mailbox.send(ControllerEvent::SignalAll).ok();
	}

	pub fn status_report(&self, id: ParticipantId, status: ParticipantStatus) {
		self.mailbox
			.send(ControllerEvent::StatusReport(id, Box::new(status)))
			.ok();
	}

	pub async fn status(&self) -> Result<SfuStatus> {
		let (tx, rx) = oneshot::channel();
		self.mailbox.send(ControllerEvent::GetStatus(tx))?;
		rx.await.map_err(|_| Error::MailboxAborted)
	}

	pub async fn servers(&self) -> Result<Vec<String>> {
		let (tx, rx) = oneshot::channel();
		self.mailbox.send(ControllerEvent::GetServers(tx))?;
		rx.await.map_err(|_| Error::MailboxAborted)
	}

	/// Replace the intended trunk set and reconcile the running set toward
	/// it, returning the post-reconciliation running set.
	pub async fn set_servers(&self, servers: Vec<String>) -> Result<Vec<String>> {
		let (tx, rx) = oneshot::channel();
		self.mailbox.send(ControllerEvent::SetServers(servers, tx))?;
		rx.await.map_err(|_| Error::MailboxAborted)
	}
}

struct TrunkEntry {
	member: Member,
	// Set once stop has been requested; the entry stays in the running set
	// until the actor reports back through RemoveParticipant.
	stopping: bool,
}

struct Controller {
	handle: ControllerHandle,
	mailbox: Mailbox<ControllerEvent>,

	members: Vec<Member>,

	// The registry: every track currently being relayed, by umbrella id.
	tracks: HashMap<String, IncomingTrack>,

	// Trunk supervision: the intended set is authoritative, the running set
	// converges toward it.
	intended: HashSet<String>,
	running: HashMap<String, TrunkEntry>,

	// Latest snapshot pushed by each participant.
	status_cache: HashMap<ParticipantId, ParticipantStatus>,

	factory: Arc<dyn SessionFactory>,
	dialer: Option<Arc<dyn SignalDialer>>,
	camera: Option<Arc<dyn CameraConnector>>,
}

impl Controller {
	fn server_list(&self) -> Vec<String> {
		let mut servers: Vec<String> = self.running.keys().cloned().collect();
		servers.sort();
		servers
	}

	fn status(&self) -> SfuStatus {
		SfuStatus {
			relaying_tracks: self.tracks.values().map(|track| track.descriptor.clone()).collect(),
			servers: self.server_list(),
			clients: self
				.members
				.iter()
				.filter_map(|member| self.status_cache.get(&member.id()).cloned())
				.collect(),
		}
	}

	async fn reconcile(&mut self) {
		// Wind down running trunks that are no longer intended. They leave
		// the running set only once their cleanup reports back.
		for (url, entry) in self.running.iter_mut() {
			if !self.intended.contains(url) && !entry.stopping {
				tracing::info!(%url, "stopping trunk");
				entry.stopping = true;
				entry.member.stop();
			}
		}

		let wanted: Vec<String> = self
			.intended
			.iter()
			.filter(|url| !self.running.contains_key(*url))
			.cloned()
			.collect();

		for url in wanted {
			match self.spawn_trunk(&url).await {
				Ok(member) => {
					tracing::info!(%url, "starting trunk");
					self.running.insert(
						url,
						TrunkEntry {
							member,
							stopping: false,
						},
					);
				}
				Err(err) => tracing::error!(%url, ?err, "failed to start trunk"),
			}
		}
	}

	async fn spawn_trunk(&self, raw: &str) -> Result<Member> {
		let url = Url::parse(raw).map_err(|err| Error::Dial(err.to_string()))?;

		if url.scheme().starts_with("rtsp") {
			let handle = CameraTrunk::spawn(url, self.handle.clone(), self.camera.clone())?;
			Ok(Member::Camera(handle))
		} else {
			let handle = Participant::trunk(url, self.handle.clone(), self.factory.clone(), self.dialer.clone()).await?;
			Ok(Member::Peer(handle))
		}
	}
}

#[async_trait]
impl Actor for Controller {
	type Message = ControllerEvent;

	async fn handle(&mut self, event: ControllerEvent) {
		let mut signal = false;

		match event {
			ControllerEvent::AddParticipant(member) => {
				tracing::info!(label = %member.label(), "adding participant");

				// Everything already relaying goes to the newcomer.
				for track in self.tracks.values() {
					member.add_outgoing(track);
				}

				self.members.push(member);
				signal = true;
			}
			ControllerEvent::RemoveParticipant(id) => {
				self.members.retain(|member| member.id() != id);
				self.status_cache.remove(&id);

				// A trunk that finished tearing down leaves the running set
				// now, and reconciliation may respawn its URL.
				let stopped: Vec<String> = self
					.running
					.iter()
					.filter(|(_, entry)| entry.member.id() == id)
					.map(|(url, _)| url.clone())
					.collect();

				if !stopped.is_empty() {
					for url in stopped {
						self.running.remove(&url);
					}
					self.reconcile().await;
				}

				signal = true;
			}
			ControllerEvent::AddTrack(track) => {
				tracing::info!(track = %track, "adding track");
				self.tracks.insert(track.umbrella_id().to_string(), track.clone());

				for member in &self.members {
					member.add_outgoing(&track);
				}

				signal = true;
			}
			ControllerEvent::RemoveTrack(umbrella_id) => {
				tracing::info!(%umbrella_id, "removing track");
				self.tracks.remove(&umbrella_id);

				for member in &self.members {
					member.remove_outgoing(&umbrella_id);
				}

				signal = true;
			}
			ControllerEvent::SignalAll => signal = true,
			ControllerEvent::StatusReport(id, status) => {
				self.status_cache.insert(id, *status);
			}
			ControllerEvent::GetStatus(reply) => {
				reply.send(self.status()).ok();
			}
			ControllerEvent::GetServers(reply) => {
				reply.send(self.server_list()).ok();
			}
			ControllerEvent::SetServers(servers, reply) => {
				self.intended = servers.into_iter().collect();
				self.reconcile().await;
				signal = true;

				reply.send(self.server_list()).ok();
			}
		}

		if signal {
			// Collapse any queued broadcast into this one.
			self.mailbox.cancel(ControllerTag::SignalAll);

			for member in &self.members {
				member.request_eval();
			}
		}
	}

	async fn cleanup(&mut self) {
		// The routing table just died; no part of the node can make
		// progress, so go down loudly.
		tracing::error!("sfu controller terminated");
		std::process::abort();
	}
}

/// Everything the node needs from its environment.
pub struct SfuOptions {
	pub factory: Arc<dyn SessionFactory>,
	pub dialer: Option<Arc<dyn SignalDialer>>,
	pub camera: Option<Arc<dyn CameraConnector>>,
}

/// A selective forwarding unit: accepts participants, relays every published
/// track to everyone else, and trunks to peer nodes and cameras.
pub struct Sfu {
	handle: ControllerHandle,
	factory: Arc<dyn SessionFactory>,
}

impl Sfu {
	pub fn new(options: SfuOptions) -> Self {
		let mailbox = Mailbox::new("sfu", MAILBOX_CAPACITY);
		let handle = ControllerHandle::new(mailbox.clone());

		let controller = Controller {
			handle: handle.clone(),
			mailbox: mailbox.clone(),
			members: Vec::new(),
			tracks: HashMap::new(),
			intended: HashSet::new(),
			running: HashMap::new(),
			status_cache: HashMap::new(),
			factory: options.factory.clone(),
			dialer: options.dialer,
			camera: options.camera,
		};

		actor::spawn(mailbox, controller);

		Self {
			handle,
			factory: options.factory,
		}
	}

	/// Run a participant for an accepted signalling connection.
	pub async fn accept(&self, label: &str, connection: SignalConnection) -> Result<ParticipantHandle> {
		Participant::accept(label, connection, self.handle.clone(), self.factory.clone()).await
	}

	pub fn handle(&self) -> ControllerHandle {
		self.handle.clone()
	}

	pub async fn status(&self) -> Result<SfuStatus> {
		self.handle.status().await
	}

	pub async fn servers(&self) -> Result<Vec<String>> {
		self.handle.servers().await
	}

	pub async fn set_servers(&self, servers: Vec<String>) -> Result<Vec<String>> {
		self.handle.set_servers(servers).await
	}
}
