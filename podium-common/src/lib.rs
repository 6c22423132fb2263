// Copyright (C) 2026 Podium
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_TURN_SECONDS: u64 = 10;
pub const DEFAULT_BALLOT_WINDOW_SECONDS: u64 = 10;
pub const DEFAULT_SCORE_DIFF_THRESHOLD: i64 = 100;
/// Cadence of the per-room clock; every tick rebroadcasts the remaining time.
pub const CLOCK_TICK_MILLIS: u64 = 30;
/// A round is contested by at most two sides; a single side is a legal
/// degenerate room, not an error.
pub const MAX_SIDES: usize = 2;

pub type RoomId = String;
pub type UserId = String;
pub type MessageId = Uuid;
/// Category name to integer points, as delivered by the evaluator pipeline.
pub type ScoreMap = HashMap<String, i64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Jury,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundPhase {
    Idle,
    InRound,
    BallotOpen,
    Resolved,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Timeout,
    ScoreDiff,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Verdict {
    pub winner_id: UserId,
    pub loser_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnMessage {
    pub id: MessageId,
    pub author_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Attached asynchronously by the evaluator; stays empty if it never answers.
    pub score: Option<ScoreMap>,
}

/// Sum of all category points in one score map.
pub fn score_total(score: &ScoreMap) -> i64 {
    score.values().sum()
}

/// Roster snapshot read from the room directory. Membership changes are owned
/// elsewhere; the session only observes the resulting record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub room_id: RoomId,
    pub owner_id: UserId,
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub jurors: Vec<UserId>,
}

impl RoomRecord {
    /// Dedupes both lists and strips participants out of the juror list, so
    /// the two sets are disjoint by the time the session sees them.
    pub fn sanitized(mut self) -> Self {
        let mut seen = HashSet::new();
        self.participants.retain(|user| seen.insert(user.clone()));
        let sides: HashSet<UserId> = self.participants.iter().cloned().collect();
        let mut seen_jurors = HashSet::new();
        self.jurors
            .retain(|user| !sides.contains(user) && seen_jurors.insert(user.clone()));
        self
    }
}

/// Tunable round parameters; the service may override the defaults from a
/// YAML rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRules {
    #[serde(default = "default_turn_seconds")]
    pub turn_seconds: u64,
    #[serde(default = "default_ballot_window_seconds")]
    pub ballot_window_seconds: u64,
    #[serde(default = "default_score_diff_threshold")]
    pub score_diff_threshold: i64,
}

fn default_turn_seconds() -> u64 {
    DEFAULT_TURN_SECONDS
}

fn default_ballot_window_seconds() -> u64 {
    DEFAULT_BALLOT_WINDOW_SECONDS
}

fn default_score_diff_threshold() -> i64 {
    DEFAULT_SCORE_DIFF_THRESHOLD
}

impl Default for RoomRules {
    fn default() -> Self {
        Self {
            turn_seconds: DEFAULT_TURN_SECONDS,
            ballot_window_seconds: DEFAULT_BALLOT_WINDOW_SECONDS,
            score_diff_threshold: DEFAULT_SCORE_DIFF_THRESHOLD,
        }
    }
}

/// Frames a connected client may send over the room stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage { text: String },
    CastVote { choice_id: UserId },
    Typing { is_typing: bool },
    Leave,
}

/// Events fanned out to every connection streaming a room.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArenaEvent {
    UserJoined {
        user_id: UserId,
        role: Role,
    },
    UserLeft {
        user_id: UserId,
    },
    UserTyping {
        user_id: UserId,
        is_typing: bool,
    },
    MessageAdded {
        message: TurnMessage,
    },
    ScoreAttached {
        message_id: MessageId,
        totals: HashMap<UserId, i64>,
    },
    TurnChanged {
        holder_id: UserId,
        remaining_ms: u64,
    },
    TurnTick {
        holder_id: UserId,
        remaining_ms: u64,
    },
    RoundEnded {
        round: u32,
        verdict: Verdict,
        reason: EndReason,
    },
    BallotOpened {
        jurors: Vec<UserId>,
        remaining_ms: u64,
    },
    BallotTick {
        votes: HashMap<UserId, UserId>,
        remaining_ms: u64,
    },
    BallotClosed {
        verdict: Verdict,
    },
    FinalVerdict {
        verdict: Verdict,
    },
    RematchStarted {
        round: u32,
    },
    RoundAbandoned {
        round: u32,
    },
    RoomClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRoundResponse {
    pub started: bool,
    pub reason: Option<String>,
    pub round: u32,
    pub phase: RoundPhase,
    pub holder_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachScoreResponse {
    pub applied: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BallotView {
    pub jurors: Vec<UserId>,
    pub votes: HashMap<UserId, UserId>,
    pub remaining_ms: u64,
}

/// Query surface for one room, used to render UI and to gate round start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: RoomId,
    pub phase: RoundPhase,
    pub round: u32,
    pub owner_id: UserId,
    pub participants: Vec<UserId>,
    pub jurors: Vec<UserId>,
    pub current_holder_id: Option<UserId>,
    pub turn_remaining_ms: Option<u64>,
    pub messages: Vec<TurnMessage>,
    pub totals: HashMap<UserId, i64>,
    pub first_verdict: Option<Verdict>,
    pub second_verdict: Option<Verdict>,
    pub final_verdict: Option<Verdict>,
    pub end_reason: Option<EndReason>,
    pub ballot: Option<BallotView>,
}
