//! Conflict ledger and operator-driven resolution.
//!
//! A conflict is opened for a GUID held by more than one row in a store, or
//! held by copies that differ in a way sync must not repair on its own. Each
//! conflict walks `Detected → PendingDecision → Resolved → Applied`; nothing
//! is written to either store before the operator decides. Dismissal sends a
//! conflict back to `Detected` and it is shown again on the next pass.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{SlError, SlResult};
use crate::fsutil::atomic_write_bytes;
use crate::model::{Guid, RecordBody, RowRef, StoreKind, StoreRecord};
use crate::store::SharedStore;

const LEDGER_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Ledger entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DuplicateGuid,
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    Detected,
    PendingDecision,
    Resolved,
    Applied,
}

impl ConflictState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::PendingDecision => "pending_decision",
            Self::Resolved => "resolved",
            Self::Applied => "applied",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyRef {
    pub store: StoreKind,
    pub row: RowRef,
}

/// Copies of one GUID that share identical content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub fingerprint: String,
    pub body: RecordBody,
    pub copies: Vec<CopyRef>,
}

/// Operator decision. Variants are numbered in ledger order: 0 is "A",
/// 1 is "B".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    /// Keep one variant under the GUID and discard every other copy.
    Keep { variant: usize },
    /// Move one variant to a fresh GUID; the rest keep the original.
    AssignNewGuid { variant: usize },
}

impl Decision {
    pub const KEEP_A: Self = Self::Keep { variant: 0 };
    pub const KEEP_B: Self = Self::Keep { variant: 1 };
    pub const SPLIT_A: Self = Self::AssignNewGuid { variant: 0 };
    pub const SPLIT_B: Self = Self::AssignNewGuid { variant: 1 };

    #[must_use]
    pub const fn variant(self) -> usize {
        match self {
            Self::Keep { variant } | Self::AssignNewGuid { variant } => variant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOutcome {
    pub applied_at_rfc3339: String,
    pub decision: Decision,
    pub new_guid: Option<Guid>,
    pub rows_deleted: usize,
    pub rows_reidentified: usize,
    pub rows_copied: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at_rfc3339: String,
    pub state: ConflictState,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictEntry {
    pub guid: Guid,
    pub kind: ConflictKind,
    pub state: ConflictState,
    pub detected_at_rfc3339: String,
    pub last_seen_rfc3339: String,
    pub detection_count: u32,
    pub variants: Vec<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Content chosen by the decision; survives re-detection reordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_fingerprint: Option<String>,
    /// Minted when a split is decided and reused by every apply attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_guid: Option<Guid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied: Option<AppliedOutcome>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl ConflictEntry {
    #[must_use]
    pub fn copy_count(&self) -> usize {
        self.variants.iter().map(|variant| variant.copies.len()).sum()
    }

    #[must_use]
    pub fn stores(&self) -> Vec<StoreKind> {
        let mut stores: Vec<StoreKind> = self
            .variants
            .iter()
            .flat_map(|variant| variant.copies.iter().map(|copy| copy.store))
            .collect();
        stores.sort();
        stores.dedup();
        stores
    }

    #[must_use]
    pub const fn is_open(&self) -> bool {
        !matches!(self.state, ConflictState::Applied)
    }

    fn transition(&mut self, state: ConflictState, note: impl Into<String>) {
        self.state = state;
        self.history.push(HistoryEntry {
            at_rfc3339: Utc::now().to_rfc3339(),
            state,
            note: note.into(),
        });
    }
}

/// Group copies by content fingerprint. Variants are ordered by their first
/// copy (database before spreadsheet, then row), so the ordering is stable
/// across passes while the rows do not move.
#[must_use]
pub fn group_variants(records: &[StoreRecord]) -> Vec<Variant> {
    let mut variants: Vec<Variant> = Vec::new();
    let mut sorted: Vec<&StoreRecord> = records.iter().collect();
    sorted.sort_by_key(|record| (record.store, record.row));
    for record in sorted {
        let fingerprint = record.body.fingerprint();
        let copy = CopyRef {
            store: record.store,
            row: record.row,
        };
        match variants.iter_mut().find(|variant| variant.fingerprint == fingerprint) {
            Some(variant) => variant.copies.push(copy),
            None => variants.push(Variant {
                fingerprint,
                body: record.body.clone(),
                copies: vec![copy],
            }),
        }
    }
    variants
}

// ---------------------------------------------------------------------------
// Ledger file
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<ConflictEntry>,
}

/// Persisted conflicts, written atomically after every change.
#[derive(Debug)]
pub struct ConflictLedger {
    path: PathBuf,
    entries: Vec<ConflictEntry>,
}

impl ConflictLedger {
    /// Load the ledger, starting empty when the file does not exist.
    pub fn load(path: &Path) -> SlResult<Self> {
        let entries = if path.exists() {
            let text = fs::read_to_string(path)?;
            if text.trim().is_empty() {
                Vec::new()
            } else {
                let file: LedgerFile = serde_json::from_str(&text).map_err(|error| {
                    SlError::Storage(format!("invalid conflict ledger {}: {error}", path.display()))
                })?;
                file.entries
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn save(&self) -> SlResult<()> {
        let file = LedgerFile {
            version: LEDGER_VERSION,
            entries: self.entries.clone(),
        };
        atomic_write_bytes(&self.path, &serde_json::to_vec_pretty(&file)?)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn entries(&self) -> &[ConflictEntry] {
        &self.entries
    }

    pub fn open_entries(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.entries.iter().filter(|entry| entry.is_open())
    }

    #[must_use]
    pub fn open_entry(&self, guid: &Guid) -> Option<&ConflictEntry> {
        self.entries
            .iter()
            .find(|entry| entry.guid == *guid && entry.is_open())
    }

    fn open_entry_mut(&mut self, guid: &Guid) -> SlResult<&mut ConflictEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.guid == *guid && entry.is_open())
            .ok_or_else(|| SlError::ConflictState(format!("no open conflict for guid {guid}")))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Asks the operator for a decision. `None` dismisses the conflict.
pub trait DecisionPrompt {
    fn decide(&mut self, entry: &ConflictEntry) -> SlResult<Option<Decision>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewSummary {
    pub applied: usize,
    pub dismissed: usize,
}

pub struct ConflictResolver {
    database: SharedStore,
    spreadsheet: SharedStore,
    ledger: ConflictLedger,
}

impl ConflictResolver {
    #[must_use]
    pub const fn new(database: SharedStore, spreadsheet: SharedStore, ledger: ConflictLedger) -> Self {
        Self {
            database,
            spreadsheet,
            ledger,
        }
    }

    #[must_use]
    pub const fn ledger(&self) -> &ConflictLedger {
        &self.ledger
    }

    fn store(&self, kind: StoreKind) -> &SharedStore {
        match kind {
            StoreKind::Database => &self.database,
            StoreKind::Spreadsheet => &self.spreadsheet,
        }
    }

    fn copies(&self, guid: &Guid) -> SlResult<Vec<StoreRecord>> {
        let mut records = self.database.with(|store| store.records_for_guid(guid))?;
        records.extend(self.spreadsheet.with(|store| store.records_for_guid(guid))?);
        Ok(records)
    }

    /// Record (or refresh) a conflict for `guid` from the copies currently
    /// stored. Returns `false` when the copies no longer conflict.
    pub fn record_detected(&mut self, guid: Guid, kind: ConflictKind) -> SlResult<bool> {
        let records = self.copies(&guid)?;
        let variants = group_variants(&records);
        let conflicting = match kind {
            ConflictKind::DuplicateGuid => StoreKind::ALL
                .iter()
                .any(|store| records.iter().filter(|r| r.store == *store).count() > 1),
            ConflictKind::Mismatch => variants.len() > 1,
        };
        if !conflicting {
            tracing::debug!(guid = %guid, ?kind, "conflict no longer present");
            return Ok(false);
        }

        let now = Utc::now().to_rfc3339();
        if let Ok(entry) = self.ledger.open_entry_mut(&guid) {
            entry.last_seen_rfc3339.clone_from(&now);
            entry.detection_count = entry.detection_count.saturating_add(1);
            if entry.variants != variants {
                entry.history.push(HistoryEntry {
                    at_rfc3339: now,
                    state: entry.state,
                    note: format!("copies changed: {} variant(s)", variants.len()),
                });
                entry.variants = variants;
            }
            tracing::debug!(guid = %guid, state = entry.state.as_str(), "conflict re-detected");
        } else {
            tracing::warn!(
                guid = %guid,
                ?kind,
                copies = records.len(),
                variants = variants.len(),
                "conflict detected"
            );
            let mut entry = ConflictEntry {
                guid,
                kind,
                state: ConflictState::Detected,
                detected_at_rfc3339: now.clone(),
                last_seen_rfc3339: now,
                detection_count: 1,
                variants,
                decision: None,
                decided_fingerprint: None,
                new_guid: None,
                applied: None,
                history: Vec::new(),
            };
            entry.transition(ConflictState::Detected, format!("{} copies", records.len()));
            self.ledger.entries.push(entry);
        }
        self.ledger.save()?;
        Ok(true)
    }

    /// Move a conflict to `PendingDecision` and return it for display.
    pub fn begin_decision(&mut self, guid: &Guid) -> SlResult<ConflictEntry> {
        let entry = self.ledger.open_entry_mut(guid)?;
        match entry.state {
            ConflictState::Detected => entry.transition(ConflictState::PendingDecision, "shown to operator"),
            ConflictState::PendingDecision => {}
            other => {
                return Err(SlError::ConflictState(format!(
                    "conflict {guid} is {}; cannot request a decision",
                    other.as_str()
                )));
            }
        }
        let snapshot = entry.clone();
        self.ledger.save()?;
        Ok(snapshot)
    }

    pub fn dismiss(&mut self, guid: &Guid) -> SlResult<()> {
        let entry = self.ledger.open_entry_mut(guid)?;
        entry.decision = None;
        entry.decided_fingerprint = None;
        entry.transition(ConflictState::Detected, "dismissed by operator");
        tracing::info!(guid = %guid, "conflict dismissed");
        self.ledger.save()
    }

    pub fn decide(&mut self, guid: &Guid, decision: Decision) -> SlResult<()> {
        let entry = self.ledger.open_entry_mut(guid)?;
        if entry.state != ConflictState::PendingDecision {
            return Err(SlError::ConflictState(format!(
                "conflict {guid} is {}; a decision needs pending_decision",
                entry.state.as_str()
            )));
        }
        let variant = entry.variants.get(decision.variant()).ok_or_else(|| {
            SlError::InvalidRequest(format!(
                "conflict {guid} has {} variant(s); variant {} does not exist",
                entry.variants.len(),
                decision.variant()
            ))
        })?;
        if matches!(decision, Decision::AssignNewGuid { .. }) && entry.variants.len() < 2 {
            return Err(SlError::ConflictState(format!(
                "conflict {guid} has a single variant; keep it instead of assigning a new guid"
            )));
        }
        entry.decided_fingerprint = Some(variant.fingerprint.clone());
        entry.decision = Some(decision);
        match decision {
            Decision::AssignNewGuid { .. } => {
                entry.new_guid.get_or_insert_with(Guid::new_random);
            }
            Decision::Keep { .. } => entry.new_guid = None,
        }
        entry.transition(ConflictState::Resolved, format!("{decision:?}"));
        self.ledger.save()
    }

    /// Carry out a resolved decision against both stores.
    pub fn apply(&mut self, guid: &Guid) -> SlResult<AppliedOutcome> {
        let (decision, fingerprint, new_guid) = {
            let entry = self.ledger.open_entry_mut(guid)?;
            match (entry.state, entry.decision, entry.decided_fingerprint.clone()) {
                (ConflictState::Resolved, Some(decision), Some(fingerprint)) => {
                    (decision, fingerprint, entry.new_guid)
                }
                (state, ..) => {
                    return Err(SlError::ConflictState(format!(
                        "conflict {guid} is {}; only resolved conflicts can be applied",
                        state.as_str()
                    )));
                }
            }
        };

        let mut records = self.copies(guid)?;
        if let Some(new_guid) = new_guid {
            records.extend(self.copies(&new_guid)?);
        }
        let Some(chosen) = records.iter().find(|r| r.body.fingerprint() == fingerprint) else {
            return Err(SlError::ConflictState(format!(
                "conflict {guid}: the chosen copy is no longer stored; dismiss and re-run sync"
            )));
        };
        let chosen_body = chosen.body.clone();

        let mut outcome = AppliedOutcome {
            applied_at_rfc3339: String::new(),
            decision,
            new_guid: None,
            rows_deleted: 0,
            rows_reidentified: 0,
            rows_copied: 0,
        };
        match decision {
            Decision::Keep { .. } => {
                self.keep_only(guid, &fingerprint, &chosen_body, &mut outcome)?;
            }
            Decision::AssignNewGuid { .. } => {
                let new_guid = new_guid.ok_or_else(|| {
                    SlError::ConflictState(format!(
                        "conflict {guid} has no guid reserved for the split; decide again"
                    ))
                })?;
                self.split(guid, new_guid, &fingerprint, &chosen_body, &mut outcome)?;
            }
        }
        outcome.applied_at_rfc3339 = Utc::now().to_rfc3339();

        let entry = self.ledger.open_entry_mut(guid)?;
        entry.applied = Some(outcome.clone());
        entry.transition(
            ConflictState::Applied,
            format!(
                "deleted {}, re-identified {}, copied {}",
                outcome.rows_deleted, outcome.rows_reidentified, outcome.rows_copied
            ),
        );
        self.ledger.save()?;
        tracing::info!(
            guid = %guid,
            ?decision,
            new_guid = ?outcome.new_guid.map(|g| g.to_string()),
            deleted = outcome.rows_deleted,
            copied = outcome.rows_copied,
            "conflict applied"
        );
        Ok(outcome)
    }

    /// Delete rows holding `guid` whose content is not `fingerprint`, and
    /// every extra identical copy; returns whether a copy survives.
    fn collapse_to(
        &self,
        store: StoreKind,
        guid: &Guid,
        fingerprint: &str,
        outcome: &mut AppliedOutcome,
    ) -> SlResult<bool> {
        self.store(store).with(|handle| {
            let copies = handle.records_for_guid(guid)?;
            let keep = copies
                .iter()
                .filter(|record| record.body.fingerprint() == fingerprint)
                .map(|record| record.row)
                .min();
            let mut doomed: Vec<RowRef> = copies
                .iter()
                .map(|record| record.row)
                .filter(|row| Some(*row) != keep)
                .collect();
            // Spreadsheet rows shift up on delete.
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            for row in doomed {
                handle.delete_row(row)?;
                outcome.rows_deleted += 1;
            }
            Ok(keep.is_some())
        })
    }

    fn ensure_copy(
        &self,
        store: StoreKind,
        guid: Guid,
        body: &RecordBody,
        present: bool,
        outcome: &mut AppliedOutcome,
    ) -> SlResult<()> {
        if present {
            return Ok(());
        }
        self.store(store)
            .with(|handle| handle.append_record(&body.with_guid(guid)))?;
        outcome.rows_copied += 1;
        Ok(())
    }

    fn keep_only(
        &self,
        guid: &Guid,
        fingerprint: &str,
        body: &RecordBody,
        outcome: &mut AppliedOutcome,
    ) -> SlResult<()> {
        for store in StoreKind::ALL {
            let present = self.collapse_to(store, guid, fingerprint, outcome)?;
            self.ensure_copy(store, *guid, body, present, outcome)?;
        }
        Ok(())
    }

    /// Move the chosen content to `new_guid`. Rows an earlier attempt
    /// already moved are left in place, so a failed apply can be retried.
    fn split(
        &self,
        guid: &Guid,
        new_guid: Guid,
        fingerprint: &str,
        body: &RecordBody,
        outcome: &mut AppliedOutcome,
    ) -> SlResult<()> {
        outcome.new_guid = Some(new_guid);

        for store in StoreKind::ALL {
            let reidentified = self.store(store).with(|handle| {
                let moved = !handle.records_for_guid(&new_guid)?.is_empty();
                let mut rows: Vec<RowRef> = handle
                    .records_for_guid(guid)?
                    .into_iter()
                    .filter(|record| record.body.fingerprint() == fingerprint)
                    .map(|record| record.row)
                    .collect();
                rows.sort_unstable();
                let extras = match rows.split_first() {
                    Some((first, extras)) if !moved => {
                        handle.assign_guid(*first, new_guid)?;
                        outcome.rows_reidentified += 1;
                        extras
                    }
                    _ => rows.as_slice(),
                };
                for row in extras.iter().rev() {
                    handle.delete_row(*row)?;
                    outcome.rows_deleted += 1;
                }
                Ok(moved || !rows.is_empty())
            })?;
            self.ensure_copy(store, new_guid, body, reidentified, outcome)?;
        }

        // The remaining copies keep the original guid. A single remaining
        // variant is made consistent; several stay in conflict.
        let remaining = group_variants(&self.copies(guid)?);
        if let [survivor] = remaining.as_slice() {
            for store in StoreKind::ALL {
                let present = self.collapse_to(store, guid, &survivor.fingerprint, outcome)?;
                self.ensure_copy(store, *guid, &survivor.body, present, outcome)?;
            }
        } else if remaining.len() > 1 {
            tracing::warn!(
                guid = %guid,
                variants = remaining.len(),
                "original guid still holds several variants"
            );
        }
        Ok(())
    }

    /// Walk every open conflict through the prompt: a decision is applied
    /// at once, `None` dismisses.
    pub fn review(&mut self, prompt: &mut dyn DecisionPrompt) -> SlResult<ReviewSummary> {
        let guids: Vec<Guid> = self
            .ledger
            .open_entries()
            .filter(|entry| entry.state != ConflictState::Resolved)
            .map(|entry| entry.guid)
            .collect();
        let mut summary = ReviewSummary::default();
        for guid in guids {
            let entry = self.begin_decision(&guid)?;
            match prompt.decide(&entry)? {
                Some(decision) => {
                    self.decide(&guid, decision)?;
                    self.apply(&guid)?;
                    summary.applied += 1;
                }
                None => {
                    self.dismiss(&guid)?;
                    summary.dismissed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Open conflicts grouped by state, for status lines.
    #[must_use]
    pub fn open_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.ledger.open_entries() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        counts
    }
}
