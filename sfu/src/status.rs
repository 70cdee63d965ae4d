use crate::{MidMapping, TrackDescriptor};

/// Transport-level state of one media session.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SessionStatus {
	pub connection_state: String,
	pub signaling_state: String,
	pub ice_connection_state: String,
	pub ice_gathering_state: String,
	pub transceivers: usize,
	pub senders: usize,
	pub receivers: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SenderStatus {
	pub umbrella_id: String,
	pub has_track: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub track_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StagedTrackStatus {
	pub id: String,
	pub stream_id: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub mid: Option<String>,
}

/// Snapshot of one participant, pushed to the controller on change.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParticipantStatus {
	pub label: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trunk_url: Option<String>,
	pub inbound: SessionStatus,
	pub outbound: SessionStatus,
	pub incoming_tracks: Vec<TrackDescriptor>,
	pub outgoing_tracks: Vec<TrackDescriptor>,
	pub senders: Vec<SenderStatus>,
	pub mid_mappings: Vec<MidMapping>,
	pub staged: Vec<StagedTrackStatus>,
}

/// Aggregate served by `GET /status`.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct SfuStatus {
	pub relaying_tracks: Vec<TrackDescriptor>,
	pub servers: Vec<String>,
	pub clients: Vec<ParticipantStatus>,
}

/// Body of `GET`/`POST /servers`: the intended trunk set.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct CurrentServers {
	pub servers: Vec<String>,
}
