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

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use podium_common::{
    ArenaEvent, AttachScoreResponse, BallotView, CLOCK_TICK_MILLIS, EndReason, MAX_SIDES,
    MessageId, Role, RoomId, RoomRecord, RoomRules, RoomSnapshot, RoundPhase, ScoreMap,
    StartRoundResponse, TurnMessage, UserId, Verdict, score_total,
};
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Read access to the persisted room roster. Membership changes (promote,
/// demote, kick) happen in the room directory; the session only observes the
/// resulting record.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn fetch(&self, room_id: &str) -> anyhow::Result<Option<RoomRecord>>;
    async fn remove(&self, room_id: &str) -> anyhow::Result<()>;
}

/// Countdown for the active turn. Owned by the room task, so a superseded
/// deadline can never fire after the turn has already moved on.
#[derive(Debug, Clone)]
struct TurnClock {
    holder_id: UserId,
    remaining_ms: u64,
}

/// A timed voting window over a frozen juror set. One vote per juror, last
/// write wins.
#[derive(Debug, Clone)]
struct JuryBallot {
    jurors: Vec<UserId>,
    votes: HashMap<UserId, UserId>,
    remaining_ms: u64,
}

impl JuryBallot {
    fn new(jurors: Vec<UserId>, remaining_ms: u64) -> Self {
        Self {
            jurors,
            votes: HashMap::new(),
            remaining_ms,
        }
    }

    fn cast(&mut self, juror_id: &str, choice_id: &str) -> bool {
        if !self.jurors.iter().any(|juror| juror == juror_id) {
            return false;
        }
        self.votes
            .insert(juror_id.to_string(), choice_id.to_string());
        true
    }

    /// Plurality over the cast votes. A tied top count, or no votes at all,
    /// resolves to the fallback winner.
    fn tally(&self, fallback: &Verdict, sides: &[UserId]) -> Verdict {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for choice in self.votes.values() {
            *counts.entry(choice.as_str()).or_insert(0) += 1;
        }
        let top = counts.values().copied().max().unwrap_or(0);
        let leaders: Vec<&str> = counts
            .iter()
            .filter(|(_, count)| **count == top)
            .map(|(choice, _)| *choice)
            .collect();
        let winner_id = match leaders.as_slice() {
            [single] if top > 0 => (*single).to_string(),
            _ => fallback.winner_id.clone(),
        };
        let loser_id = sides
            .iter()
            .find(|side| side.as_str() != winner_id)
            .cloned()
            .unwrap_or_else(|| winner_id.clone());
        Verdict { winner_id, loser_id }
    }
}

/// All mutable state for one room. Exclusively owned by that room's task;
/// every method is synchronous and returns the events it wants broadcast.
pub struct RoomSession {
    room_id: RoomId,
    rules: RoomRules,
    owner_id: UserId,
    participants: Vec<UserId>,
    jurors: Vec<UserId>,
    occupants: HashSet<UserId>,
    round: u32,
    phase: RoundPhase,
    clock: Option<TurnClock>,
    ballot: Option<JuryBallot>,
    messages: Vec<TurnMessage>,
    first_verdict: Option<Verdict>,
    second_verdict: Option<Verdict>,
    final_verdict: Option<Verdict>,
    end_reason: Option<EndReason>,
}

impl RoomSession {
    pub fn new(record: RoomRecord, rules: RoomRules) -> Self {
        let record = record.sanitized();
        Self {
            room_id: record.room_id,
            rules,
            owner_id: record.owner_id,
            participants: record.participants,
            jurors: record.jurors,
            occupants: HashSet::new(),
            round: 1,
            phase: RoundPhase::Idle,
            clock: None,
            ballot: None,
            messages: Vec::new(),
            first_verdict: None,
            second_verdict: None,
            final_verdict: None,
            end_reason: None,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// The two disputant seats. Extra roster entries past the second seat
    /// never hold the turn.
    fn sides(&self) -> &[UserId] {
        let n = self.participants.len().min(MAX_SIDES);
        &self.participants[..n]
    }

    fn other_side(&self, user_id: &str) -> UserId {
        self.sides()
            .iter()
            .find(|side| side.as_str() != user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string())
    }

    fn initial_holder(&self) -> Option<UserId> {
        let sides = self.sides();
        if sides.iter().any(|side| *side == self.owner_id) {
            return Some(self.owner_id.clone());
        }
        sides.first().cloned()
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.participants.iter().any(|side| side == user_id) {
            return Some(Role::Participant);
        }
        if self.jurors.iter().any(|juror| juror == user_id) {
            return Some(Role::Jury);
        }
        None
    }

    /// Replaces the observed roster. Ignored while a round or ballot is live,
    /// so the holder-membership invariant stays local to this task.
    pub fn apply_roster(&mut self, record: RoomRecord) {
        if matches!(self.phase, RoundPhase::InRound | RoundPhase::BallotOpen) {
            debug!(room_id = %self.room_id, "roster refresh deferred during live round");
            return;
        }
        let record = record.sanitized();
        self.owner_id = record.owner_id;
        self.participants = record.participants;
        self.jurors = record.jurors;
    }

    pub fn join(&mut self, user_id: &str) -> Vec<ArenaEvent> {
        let Some(role) = self.role_of(user_id) else {
            warn!(room_id = %self.room_id, user_id, "join from user outside the roster dropped");
            return Vec::new();
        };
        if !self.occupants.insert(user_id.to_string()) {
            return Vec::new();
        }
        vec![ArenaEvent::UserJoined {
            user_id: user_id.to_string(),
            role,
        }]
    }

    pub fn typing(&self, user_id: &str, is_typing: bool) -> Vec<ArenaEvent> {
        if !self.occupants.contains(user_id) {
            return Vec::new();
        }
        vec![ArenaEvent::UserTyping {
            user_id: user_id.to_string(),
            is_typing,
        }]
    }

    pub fn start_round(&mut self) -> (StartRoundResponse, Vec<ArenaEvent>) {
        let refusal = match self.phase {
            RoundPhase::InRound => Some("ALREADY_IN_ROUND"),
            RoundPhase::BallotOpen => Some("BALLOT_OPEN"),
            RoundPhase::Resolved => Some("ALREADY_RESOLVED"),
            RoundPhase::Idle if self.participants.is_empty() => Some("NO_PARTICIPANTS"),
            RoundPhase::Idle => None,
        };
        if let Some(reason) = refusal {
            return (self.start_response(false, Some(reason)), Vec::new());
        }

        self.phase = RoundPhase::InRound;
        let mut events = Vec::new();
        if let Some(holder_id) = self.initial_holder() {
            events = self.begin_turn(holder_id);
        }
        (self.start_response(true, None), events)
    }

    fn start_response(&self, started: bool, reason: Option<&str>) -> StartRoundResponse {
        StartRoundResponse {
            started,
            reason: reason.map(str::to_string),
            round: self.round,
            phase: self.phase,
            holder_id: self.clock.as_ref().map(|clock| clock.holder_id.clone()),
        }
    }

    /// Seats a holder with a full clock and announces both.
    fn begin_turn(&mut self, holder_id: UserId) -> Vec<ArenaEvent> {
        let remaining_ms = self.rules.turn_seconds * 1_000;
        self.clock = Some(TurnClock {
            holder_id: holder_id.clone(),
            remaining_ms,
        });
        vec![ArenaEvent::TurnChanged {
            holder_id,
            remaining_ms,
        }]
    }

    /// Appends a turn message. Anything not sent by the current holder during
    /// an active round is silently discarded; those arrivals are expected
    /// races, not faults.
    pub fn handle_message(&mut self, author_id: &str, text: &str) -> Vec<ArenaEvent> {
        if self.phase != RoundPhase::InRound {
            debug!(room_id = %self.room_id, author_id, "message outside an active round dropped");
            return Vec::new();
        }
        let Some(holder_id) = self.clock.as_ref().map(|clock| clock.holder_id.clone()) else {
            return Vec::new();
        };
        if holder_id != author_id {
            debug!(room_id = %self.room_id, author_id, holder_id = %holder_id, "message from non-holder dropped");
            return Vec::new();
        }

        let message = TurnMessage {
            id: Uuid::new_v4(),
            author_id: author_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            score: None,
        };
        self.messages.push(message.clone());
        let mut events = vec![ArenaEvent::MessageAdded { message }];
        let next_holder = self.other_side(author_id);
        events.extend(self.begin_turn(next_holder));
        events
    }

    /// Attaches an evaluator score to a previously appended message. This is
    /// independent of turn ownership; the turn may long since have moved on.
    pub fn attach_score(
        &mut self,
        message_id: MessageId,
        score: ScoreMap,
    ) -> (AttachScoreResponse, Vec<ArenaEvent>) {
        let Some(message) = self
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
        else {
            return (
                AttachScoreResponse {
                    applied: false,
                    reason: Some("UNKNOWN_MESSAGE".to_string()),
                },
                Vec::new(),
            );
        };
        message.score = Some(score);

        let mut events = vec![ArenaEvent::ScoreAttached {
            message_id,
            totals: self.totals(),
        }];
        if self.phase == RoundPhase::InRound
            && let Some(verdict) = self.score_diff_verdict()
        {
            events.extend(self.end_round(EndReason::ScoreDiff, verdict));
        }
        (
            AttachScoreResponse {
                applied: true,
                reason: None,
            },
            events,
        )
    }

    fn total_for(&self, user_id: &str) -> i64 {
        self.messages
            .iter()
            .filter(|message| message.author_id == user_id)
            .filter_map(|message| message.score.as_ref())
            .map(score_total)
            .sum()
    }

    fn totals(&self) -> HashMap<UserId, i64> {
        self.participants
            .iter()
            .map(|side| (side.clone(), self.total_for(side)))
            .collect()
    }

    /// Threshold check over the running totals. Two sides end on the absolute
    /// difference; a sole participant ends on their own total crossing it,
    /// with winner and loser both naming them.
    fn score_diff_verdict(&self) -> Option<Verdict> {
        let threshold = self.rules.score_diff_threshold;
        match self.sides() {
            [] => None,
            [solo] => (self.total_for(solo) >= threshold).then(|| Verdict {
                winner_id: solo.clone(),
                loser_id: solo.clone(),
            }),
            [first, second, ..] => {
                let (t0, t1) = (self.total_for(first), self.total_for(second));
                if t0 == t1 || (t0 - t1).abs() < threshold {
                    return None;
                }
                let (winner_id, loser_id) = if t0 > t1 {
                    (first.clone(), second.clone())
                } else {
                    (second.clone(), first.clone())
                };
                Some(Verdict { winner_id, loser_id })
            }
        }
    }

    pub fn cast_vote(&mut self, juror_id: &str, choice_id: &str) -> Vec<ArenaEvent> {
        if self.phase != RoundPhase::BallotOpen {
            debug!(room_id = %self.room_id, juror_id, "vote outside an open ballot dropped");
            return Vec::new();
        }
        if !self.sides().iter().any(|side| side.as_str() == choice_id) {
            debug!(room_id = %self.room_id, juror_id, choice_id, "vote for non-participant dropped");
            return Vec::new();
        }
        let Some(ballot) = self.ballot.as_mut() else {
            return Vec::new();
        };
        if !ballot.cast(juror_id, choice_id) {
            debug!(room_id = %self.room_id, juror_id, "vote from non-juror dropped");
            return Vec::new();
        }
        vec![ArenaEvent::BallotTick {
            votes: ballot.votes.clone(),
            remaining_ms: ballot.remaining_ms,
        }]
    }

    /// Advances whichever countdown is live. Fires at most one round-ending
    /// transition; once the phase has moved on, stale elapsed time is inert.
    pub fn tick(&mut self, elapsed_ms: u64) -> Vec<ArenaEvent> {
        match self.phase {
            RoundPhase::InRound => {
                let Some(clock) = self.clock.as_mut() else {
                    return Vec::new();
                };
                clock.remaining_ms = clock.remaining_ms.saturating_sub(elapsed_ms);
                let remaining_ms = clock.remaining_ms;
                let holder_id = clock.holder_id.clone();
                if remaining_ms > 0 {
                    return vec![ArenaEvent::TurnTick {
                        holder_id,
                        remaining_ms,
                    }];
                }
                self.clock = None;
                let winner_id = self.other_side(&holder_id);
                self.end_round(
                    EndReason::Timeout,
                    Verdict {
                        winner_id,
                        loser_id: holder_id,
                    },
                )
            }
            RoundPhase::BallotOpen => {
                let Some(ballot) = self.ballot.as_mut() else {
                    return Vec::new();
                };
                ballot.remaining_ms = ballot.remaining_ms.saturating_sub(elapsed_ms);
                if ballot.remaining_ms > 0 {
                    return vec![ArenaEvent::BallotTick {
                        votes: ballot.votes.clone(),
                        remaining_ms: ballot.remaining_ms,
                    }];
                }
                self.close_ballot()
            }
            _ => Vec::new(),
        }
    }

    /// Records the first verdict for this round, then either opens the jury
    /// ballot (round 1 with jurors) or resolves outright. Round 2 never
    /// opens a ballot; the jury only adjudicates the first round.
    fn end_round(&mut self, reason: EndReason, verdict: Verdict) -> Vec<ArenaEvent> {
        self.clock = None;
        self.first_verdict = Some(verdict.clone());
        self.end_reason = Some(reason);
        info!(
            room_id = %self.room_id,
            round = self.round,
            winner_id = %verdict.winner_id,
            ?reason,
            "round ended"
        );
        let mut events = vec![ArenaEvent::RoundEnded {
            round: self.round,
            verdict: verdict.clone(),
            reason,
        }];

        if self.round == 1 && !self.jurors.is_empty() {
            let remaining_ms = self.rules.ballot_window_seconds * 1_000;
            self.ballot = Some(JuryBallot::new(self.jurors.clone(), remaining_ms));
            self.phase = RoundPhase::BallotOpen;
            events.push(ArenaEvent::BallotOpened {
                jurors: self.jurors.clone(),
                remaining_ms,
            });
        } else {
            self.phase = RoundPhase::Resolved;
            self.final_verdict = Some(verdict.clone());
            events.push(ArenaEvent::FinalVerdict { verdict });
        }
        events
    }

    /// Tallies the ballot into the second verdict, then finalizes on
    /// agreement or resets into a round-2 rematch on disagreement.
    fn close_ballot(&mut self) -> Vec<ArenaEvent> {
        let Some(ballot) = self.ballot.take() else {
            return Vec::new();
        };
        let Some(first) = self.first_verdict.clone() else {
            self.phase = RoundPhase::Resolved;
            return Vec::new();
        };
        let second = ballot.tally(&first, self.sides());
        self.second_verdict = Some(second.clone());
        let mut events = vec![ArenaEvent::BallotClosed {
            verdict: second.clone(),
        }];

        if second.winner_id == first.winner_id {
            self.phase = RoundPhase::Resolved;
            self.final_verdict = Some(first.clone());
            events.push(ArenaEvent::FinalVerdict { verdict: first });
            return events;
        }

        info!(room_id = %self.room_id, "jury overturned the round; starting rematch");
        self.round = 2;
        self.messages.clear();
        self.first_verdict = None;
        self.second_verdict = None;
        self.end_reason = None;
        events.push(ArenaEvent::RematchStarted { round: self.round });
        if let Some(holder_id) = self.initial_holder() {
            self.phase = RoundPhase::InRound;
            events.extend(self.begin_turn(holder_id));
        } else {
            self.phase = RoundPhase::Idle;
        }
        events
    }

    /// Removes a user from the room. A departing turn holder abandons the
    /// round rather than forfeiting it. Returns whether the room is now
    /// defunct (no participants and no jurors left).
    pub fn leave(&mut self, user_id: &str) -> (Vec<ArenaEvent>, bool) {
        let was_occupant = self.occupants.remove(user_id);
        if !was_occupant && self.role_of(user_id).is_none() {
            return (Vec::new(), false);
        }
        let mut events = vec![ArenaEvent::UserLeft {
            user_id: user_id.to_string(),
        }];

        if self.phase == RoundPhase::InRound
            && self
                .clock
                .as_ref()
                .is_some_and(|clock| clock.holder_id == user_id)
        {
            self.clock = None;
            self.phase = RoundPhase::Idle;
            info!(room_id = %self.room_id, user_id, round = self.round, "turn holder left; round abandoned");
            events.push(ArenaEvent::RoundAbandoned { round: self.round });
        }

        self.participants.retain(|side| side != user_id);
        self.jurors.retain(|juror| juror != user_id);

        let defunct = self.participants.is_empty() && self.jurors.is_empty();
        if defunct {
            events.push(ArenaEvent::RoomClosed);
        }
        (events, defunct)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            phase: self.phase,
            round: self.round,
            owner_id: self.owner_id.clone(),
            participants: self.participants.clone(),
            jurors: self.jurors.clone(),
            current_holder_id: self.clock.as_ref().map(|clock| clock.holder_id.clone()),
            turn_remaining_ms: self.clock.as_ref().map(|clock| clock.remaining_ms),
            messages: self.messages.clone(),
            totals: self.totals(),
            first_verdict: self.first_verdict.clone(),
            second_verdict: self.second_verdict.clone(),
            final_verdict: self.final_verdict.clone(),
            end_reason: self.end_reason,
            ballot: self.ballot.as_ref().map(|ballot| BallotView {
                jurors: ballot.jurors.clone(),
                votes: ballot.votes.clone(),
                remaining_ms: ballot.remaining_ms,
            }),
        }
    }
}

/// Commands routed to a room's task. Fire-and-forget for client traffic,
/// request/reply for the REST surface.
#[derive(Debug)]
pub enum RoomCommand {
    Join {
        user_id: UserId,
    },
    SendMessage {
        author_id: UserId,
        text: String,
    },
    AttachScore {
        message_id: MessageId,
        score: ScoreMap,
        reply: Option<oneshot::Sender<AttachScoreResponse>>,
    },
    CastVote {
        juror_id: UserId,
        choice_id: UserId,
    },
    Typing {
        user_id: UserId,
        is_typing: bool,
    },
    Leave {
        user_id: UserId,
    },
    StartRound {
        reply: Option<oneshot::Sender<StartRoundResponse>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

#[derive(Clone)]
pub struct RoomHandle {
    pub commands: mpsc::UnboundedSender<RoomCommand>,
    pub events: broadcast::Sender<ArenaEvent>,
}

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Process-wide map of live rooms. Injected into the transport layer; rooms
/// are created lazily on first use and deregister themselves on teardown.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<RoomId, RoomHandle>>>,
    roster: Arc<dyn RosterStore>,
    rules: RoomRules,
}

impl RoomRegistry {
    pub fn new(roster: Arc<dyn RosterStore>, rules: RoomRules) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            roster,
            rules,
        }
    }

    /// Returns the handle for a room, spawning its task on first use. `None`
    /// means the room directory has no record for this id.
    pub async fn ensure_room(&self, room_id: &str) -> anyhow::Result<Option<RoomHandle>> {
        {
            let rooms = self.rooms.lock().await;
            if let Some(handle) = rooms.get(room_id) {
                return Ok(Some(handle.clone()));
            }
        }

        let Some(record) = self.roster.fetch(room_id).await? else {
            return Ok(None);
        };

        let mut rooms = self.rooms.lock().await;
        if let Some(handle) = rooms.get(room_id) {
            return Ok(Some(handle.clone()));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let handle = RoomHandle {
            commands: commands_tx,
            events: events_tx.clone(),
        };
        rooms.insert(room_id.to_string(), handle.clone());

        let session = RoomSession::new(record, self.rules.clone());
        info!(room_id, "room session created");
        tokio::spawn(run_room(
            session,
            commands_rx,
            events_tx,
            self.rooms.clone(),
            self.roster.clone(),
        ));
        Ok(Some(handle))
    }

    pub async fn handle(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Routes a command to a live room. Events for unknown rooms are dropped
    /// with a diagnostic, never an error.
    pub async fn dispatch(&self, room_id: &str, command: RoomCommand) -> bool {
        let Some(handle) = self.handle(room_id).await else {
            warn!(room_id, "event for unknown room dropped");
            return false;
        };
        if handle.commands.send(command).is_err() {
            warn!(room_id, "event for closing room dropped");
            return false;
        }
        true
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let handle = self.handle(room_id).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(RoomCommand::Snapshot { reply: reply_tx })
            .ok()?;
        reply_rx.await.ok()
    }
}

/// Owns one `RoomSession` for its whole lifetime. All mutation flows through
/// this loop, so round-ending signals serialize and the first one wins.
async fn run_room(
    mut session: RoomSession,
    mut commands_rx: mpsc::UnboundedReceiver<RoomCommand>,
    events_tx: broadcast::Sender<ArenaEvent>,
    rooms: Arc<Mutex<HashMap<RoomId, RoomHandle>>>,
    roster: Arc<dyn RosterStore>,
) {
    let room_id = session.room_id().to_string();
    let mut ticker = interval(Duration::from_millis(CLOCK_TICK_MILLIS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands_rx.recv() => {
                let Some(command) = command else { break };
                let (events, defunct) = apply_command(&mut session, command, &roster).await;
                forward(&events_tx, events);
                if defunct {
                    break;
                }
            }
            _ = ticker.tick() => {
                let events = session.tick(CLOCK_TICK_MILLIS);
                forward(&events_tx, events);
            }
        }
    }

    if let Err(error) = roster.remove(&room_id).await {
        warn!(room_id = %room_id, error = %error, "failed to remove backing room record");
    }
    rooms.lock().await.remove(&room_id);
    info!(room_id = %room_id, "room session torn down");
}

async fn apply_command(
    session: &mut RoomSession,
    command: RoomCommand,
    roster: &Arc<dyn RosterStore>,
) -> (Vec<ArenaEvent>, bool) {
    match command {
        RoomCommand::Join { user_id } => (session.join(&user_id), false),
        RoomCommand::SendMessage { author_id, text } => {
            (session.handle_message(&author_id, &text), false)
        }
        RoomCommand::AttachScore {
            message_id,
            score,
            reply,
        } => {
            let (response, events) = session.attach_score(message_id, score);
            if !response.applied {
                warn!(
                    message_id = %message_id,
                    reason = response.reason.as_deref().unwrap_or("none"),
                    "score attachment dropped"
                );
            }
            if let Some(reply) = reply {
                let _ = reply.send(response);
            }
            (events, false)
        }
        RoomCommand::CastVote {
            juror_id,
            choice_id,
        } => (session.cast_vote(&juror_id, &choice_id), false),
        RoomCommand::Typing { user_id, is_typing } => (session.typing(&user_id, is_typing), false),
        RoomCommand::Leave { user_id } => session.leave(&user_id),
        RoomCommand::StartRound { reply } => {
            if session.phase() == RoundPhase::Idle {
                refresh_roster(session, roster).await;
            }
            let (response, events) = session.start_round();
            if let Some(reply) = reply {
                let _ = reply.send(response);
            }
            (events, false)
        }
        RoomCommand::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
            (Vec::new(), false)
        }
    }
}

/// Re-reads the roster at round start so role changes made between rounds
/// are observed.
async fn refresh_roster(session: &mut RoomSession, roster: &Arc<dyn RosterStore>) {
    let room_id = session.room_id().to_string();
    match roster.fetch(&room_id).await {
        Ok(Some(record)) => session.apply_roster(record),
        Ok(None) => warn!(room_id = %room_id, "room record vanished; keeping cached roster"),
        Err(error) => {
            warn!(room_id = %room_id, error = %error, "roster refresh failed; keeping cached roster");
        }
    }
}

fn forward(events_tx: &broadcast::Sender<ArenaEvent>, events: Vec<ArenaEvent>) {
    for event in events {
        // Send only fails when nobody is streaming the room; that is fine.
        let _ = events_tx.send(event);
    }
}
