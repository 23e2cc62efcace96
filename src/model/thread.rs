use super::{lenient_timestamp, null_as_default};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Votes needed before a field proposal is surfaced
pub const MIN_PROPOSAL_VOTES: u32 = 3;

/// Discussion attached 1:1 to a record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    #[serde(default, deserialize_with = "null_as_default")]
    pub comments: Vec<Comment>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub votes: Votes,
    /// field name -> proposed value -> tally
    #[serde(default, deserialize_with = "null_as_default")]
    pub field_proposals: BTreeMap<String, BTreeMap<String, ProposalTally>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Votes {
    #[serde(default)]
    pub approve: u32,
    #[serde(default)]
    pub reject: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteKind {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalTally {
    #[serde(default)]
    pub votes: u32,
}

impl Votes {
    pub fn record(&mut self, kind: VoteKind) {
        match kind {
            VoteKind::Approve => self.approve += 1,
            VoteKind::Reject => self.reject += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.approve + self.reject
    }
}

impl Thread {
    /// Append a comment unless one with the same id is already present
    pub fn push_comment(&mut self, comment: Comment) -> bool {
        if self.comments.iter().any(|c| c.id == comment.id) {
            return false;
        }
        self.comments.push(comment);
        true
    }

    /// Add one vote to a proposed value for a field
    pub fn propose_field(&mut self, field: &str, value: &str) -> u32 {
        let tally = self
            .field_proposals
            .entry(field.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default();
        tally.votes += 1;
        tally.votes
    }

    /// Most voted value for a field, if it reached `min_votes`.
    /// Ties resolve to the lexicographically smallest value.
    pub fn leading_proposal(&self, field: &str, min_votes: u32) -> Option<(&str, u32)> {
        self.field_proposals
            .get(field)?
            .iter()
            .fold(None, |best: Option<(&str, u32)>, (value, tally)| match best {
                Some((_, votes)) if votes >= tally.votes => best,
                _ => Some((value.as_str(), tally.votes)),
            })
            .filter(|(_, votes)| *votes >= min_votes)
    }

    /// Union of two threads for the same record: comments by id, the larger vote
    /// counts and the larger proposal tallies
    pub fn absorb(&mut self, other: &Thread) {
        for comment in &other.comments {
            self.push_comment(comment.clone());
        }
        self.comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.votes.approve = self.votes.approve.max(other.votes.approve);
        self.votes.reject = self.votes.reject.max(other.votes.reject);
        for (field, values) in &other.field_proposals {
            let mine = self.field_proposals.entry(field.clone()).or_default();
            for (value, tally) in values {
                let entry = mine.entry(value.clone()).or_default();
                entry.votes = entry.votes.max(tally.votes);
            }
        }
    }
}
