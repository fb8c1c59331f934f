//! Reconciliation of scraped projects against the sheet snapshot.
//!
//! Matches are resolved against the snapshot read at the start of the run
//! only. Two scraped records sharing a case id that is not yet in the sheet
//! both become new rows, each with its own identifier.

use billwatch_core::{IdFormat, ParsedIdentifier, ScrapedRecord, StoreRow, StoreSnapshot};
use billwatch_storage::{sheet_position, SheetStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("identifier space exhausted: no id left after {0}")]
    IdentifiersExhausted(u64),
}

/// Allocates row identifiers in one configured layout while reading both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierAllocator {
    format: IdFormat,
    prefix: String,
}

impl IdentifierAllocator {
    pub fn new(format: IdFormat, prefix: impl Into<String>) -> Self {
        Self {
            format,
            prefix: prefix.into(),
        }
    }

    /// Writes bare numbers. Existing ids carrying `prefix` still count
    /// toward the maximum.
    pub fn plain(prefix: impl Into<String>) -> Self {
        Self::new(IdFormat::Plain, prefix)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self::new(IdFormat::Prefixed, prefix)
    }

    pub fn format(&self) -> IdFormat {
        self.format
    }

    /// Largest numeric payload among `existing`, 0 when nothing parses.
    pub fn max_existing<'a>(&self, existing: impl IntoIterator<Item = &'a str>) -> u64 {
        let mut max_prefixed = 0u64;
        let mut max_plain = 0u64;
        for raw in existing {
            let Ok(id) = ParsedIdentifier::parse(raw, &self.prefix) else {
                continue;
            };
            match id.format {
                IdFormat::Prefixed => max_prefixed = max_prefixed.max(id.value),
                IdFormat::Plain => max_plain = max_plain.max(id.value),
            }
        }
        max_prefixed.max(max_plain)
    }

    pub fn next_id<'a>(
        &self,
        existing: impl IntoIterator<Item = &'a str>,
    ) -> Result<String, ReconcileError> {
        self.counter(existing).allocate()
    }

    /// Running counter seeded once from `existing`.
    pub fn counter<'a>(&self, existing: impl IntoIterator<Item = &'a str>) -> IdCounter<'_> {
        let max = self.max_existing(existing);
        IdCounter {
            allocator: self,
            last: max,
            next: max.checked_add(1),
        }
    }

    fn render(&self, value: u64) -> String {
        ParsedIdentifier::new(value, self.format).render(&self.prefix)
    }
}

#[derive(Debug)]
pub struct IdCounter<'a> {
    allocator: &'a IdentifierAllocator,
    last: u64,
    next: Option<u64>,
}

impl IdCounter<'_> {
    /// Next unused id. Fails once the numeric space is used up instead of
    /// handing out the same id again.
    pub fn allocate(&mut self) -> Result<String, ReconcileError> {
        let value = self
            .next
            .ok_or(ReconcileError::IdentifiersExhausted(self.last))?;
        self.last = value;
        self.next = value.checked_add(1);
        Ok(self.allocator.render(value))
    }
}

/// First snapshot row whose trimmed case id equals `case_id` trimmed, with its
/// index in the snapshot.
pub fn find_match<'a>(case_id: &str, snapshot: &'a StoreSnapshot) -> Option<(usize, &'a StoreRow)> {
    if !snapshot.has_case_id_column {
        return None;
    }
    let key = case_id.trim();
    snapshot
        .rows
        .iter()
        .enumerate()
        .find(|(_, row)| row.case_id.trim() == key)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub scraped: usize,
    pub new: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowUpdate {
    /// 1-based sheet row.
    pub position: usize,
    pub row: StoreRow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOutcome {
    /// The scrape produced no records at all.
    NoData,
    /// Every scraped record matched an unchanged row.
    NothingToDo,
    Changes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WritePlan {
    pub appends: Vec<StoreRow>,
    pub updates: Vec<RowUpdate>,
    pub counts: PlanCounts,
}

impl WritePlan {
    pub fn outcome(&self) -> PlanOutcome {
        if self.counts.scraped == 0 {
            PlanOutcome::NoData
        } else if self.appends.is_empty() && self.updates.is_empty() {
            PlanOutcome::NothingToDo
        } else {
            PlanOutcome::Changes
        }
    }
}

fn new_row(id: String, rec: &ScrapedRecord) -> StoreRow {
    StoreRow {
        id,
        origin_chamber: rec.origin_chamber.clone(),
        case_id: rec.case_id.clone(),
        author: rec.author.clone(),
        start_date: rec.start_date.clone(),
        project_text: rec.project_text.clone(),
        committees: rec.committees.clone(),
        status: String::new(),
        probability: String::new(),
        party: rec.party.clone(),
        province: rec.province.clone(),
        notes: String::new(),
    }
}

/// Scraped columns from `rec`; identifier and editor columns from `existing`.
fn refreshed_row(existing: &StoreRow, rec: &ScrapedRecord) -> StoreRow {
    StoreRow {
        id: existing.id.clone(),
        status: existing.status.clone(),
        probability: existing.probability.clone(),
        notes: existing.notes.clone(),
        ..new_row(String::new(), rec)
    }
}

/// Decide, per scraped record in order, whether it is new, changed or unchanged.
pub fn reconcile(
    scraped: &[ScrapedRecord],
    snapshot: &StoreSnapshot,
    allocator: &IdentifierAllocator,
) -> Result<WritePlan, ReconcileError> {
    let mut ids = allocator.counter(snapshot.ids());
    let mut plan = WritePlan {
        counts: PlanCounts {
            scraped: scraped.len(),
            ..PlanCounts::default()
        },
        ..WritePlan::default()
    };

    for rec in scraped {
        match find_match(&rec.case_id, snapshot) {
            None => {
                let row = new_row(ids.allocate()?, rec);
                debug!(case_id = %rec.case_id, id = %row.id, "new project");
                plan.appends.push(row);
                plan.counts.new += 1;
            }
            Some((index, existing)) if existing.start_date.trim() != rec.start_date.trim() => {
                debug!(
                    case_id = %rec.case_id,
                    from = %existing.start_date,
                    to = %rec.start_date,
                    "start date changed"
                );
                plan.updates.push(RowUpdate {
                    position: sheet_position(index),
                    row: refreshed_row(existing, rec),
                });
                plan.counts.updated += 1;
            }
            Some(_) => plan.counts.skipped += 1,
        }
    }

    Ok(plan)
}

/// Write `plan` to `store`: one call per update, then a single batched append.
/// Stops at the first store error; updates already written stay written.
pub async fn apply_plan(store: &dyn SheetStore, plan: &WritePlan) -> Result<(), StoreError> {
    for update in &plan.updates {
        info!(case_id = %update.row.case_id, position = update.position, "updating project");
        store
            .update_row(update.position, &update.row.to_cells())
            .await?;
    }

    if !plan.appends.is_empty() {
        info!(rows = plan.appends.len(), "appending new projects");
        let rows: Vec<Vec<String>> = plan.appends.iter().map(StoreRow::to_cells).collect();
        store.append_rows(&rows).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use billwatch_core::{SheetTable, NO_DATA};
    use billwatch_storage::MemorySheetStore;
    use std::sync::Mutex;

    fn scraped(case_id: &str, start_date: &str) -> ScrapedRecord {
        ScrapedRecord {
            origin_chamber: "Diputados".into(),
            case_id: case_id.into(),
            author: "PEREZ, JUAN".into(),
            start_date: start_date.into(),
            project_text: "LEY DE PRUEBA".into(),
            committees: "PRESUPUESTO Y HACIENDA".into(),
            party: "UNION POR LA PATRIA".into(),
            province: "CORDOBA".into(),
        }
    }

    fn stored(id: &str, case_id: &str, start_date: &str) -> StoreRow {
        StoreRow {
            id: id.into(),
            origin_chamber: "Diputados".into(),
            case_id: case_id.into(),
            author: "VIEJO, AUTOR".into(),
            start_date: start_date.into(),
            project_text: "texto anterior".into(),
            committees: "LEGISLACION GENERAL".into(),
            status: "En comisión".into(),
            probability: "Alta".into(),
            party: "OTRO".into(),
            province: "SALTA".into(),
            notes: "llamar al despacho".into(),
        }
    }

    fn ids<'a>(raw: &'a [&'a str]) -> impl Iterator<Item = &'a str> {
        raw.iter().copied()
    }

    #[test]
    fn plain_ids_continue_from_max() {
        let alloc = IdentifierAllocator::plain("DIP-");
        assert_eq!(alloc.next_id(ids(&["3", "10", "7"])).unwrap(), "11");
        assert_eq!(alloc.next_id(ids(&["9", "", "S/D", "x12"])).unwrap(), "10");
    }

    #[test]
    fn prefixed_ids_pad_and_grow_past_three_digits() {
        let alloc = IdentifierAllocator::prefixed("DIP-");
        assert_eq!(alloc.next_id(ids(&["DIP-012", "DIP-047"])).unwrap(), "DIP-048");
        assert_eq!(alloc.next_id(ids(&["DIP-999"])).unwrap(), "DIP-1000");
        assert_eq!(alloc.next_id(ids(&["DIP-1000", "DIP-999"])).unwrap(), "DIP-1001");
        assert_eq!(alloc.next_id(ids(&["DIP-04x", "DIP-002"])).unwrap(), "DIP-003");
    }

    #[test]
    fn mixed_formats_compare_numeric_payloads() {
        let alloc = IdentifierAllocator::prefixed("DIP-");
        // "DIP-047" sorts after "120" as text but is numerically smaller.
        assert_eq!(alloc.next_id(ids(&["120", "DIP-047"])).unwrap(), "DIP-121");
        assert_eq!(alloc.next_id(ids(&["5", "DIP-047"])).unwrap(), "DIP-048");

        let plain = IdentifierAllocator::plain("DIP-");
        assert_eq!(plain.next_id(ids(&["DIP-200", "120"])).unwrap(), "201");
        assert_eq!(plain.next_id(ids(&["DIP-047", "120"])).unwrap(), "121");
    }

    #[test]
    fn empty_id_set_starts_at_one() {
        assert_eq!(IdentifierAllocator::plain("DIP-").next_id(ids(&[])).unwrap(), "1");
        assert_eq!(IdentifierAllocator::prefixed("DIP-").next_id(ids(&[])).unwrap(), "DIP-001");
    }

    #[test]
    fn counter_allocates_consecutive_ids() {
        let alloc = IdentifierAllocator::prefixed("DIP-");
        let mut counter = alloc.counter(ids(&["DIP-008"]));
        assert_eq!(counter.allocate().unwrap(), "DIP-009");
        assert_eq!(counter.allocate().unwrap(), "DIP-010");
    }

    #[test]
    fn exhausted_id_space_is_an_error_not_a_repeat() {
        let alloc = IdentifierAllocator::plain("DIP-");
        let mut counter = alloc.counter(ids(&["18446744073709551614"]));
        assert_eq!(counter.allocate().unwrap(), "18446744073709551615");
        assert_eq!(
            counter.allocate(),
            Err(ReconcileError::IdentifiersExhausted(u64::MAX))
        );
        assert!(alloc.next_id(ids(&["18446744073709551615"])).is_err());

        let snapshot = StoreSnapshot::from_rows(vec![stored("18446744073709551615", "1/24", "x")]);
        let result = reconcile(&[scraped("2/24", "01/01/2024")], &snapshot, &alloc);
        assert!(result.is_err());
    }

    #[test]
    fn matching_trims_and_prefers_first_row() {
        let snapshot = StoreSnapshot::from_rows(vec![
            stored("1", " 10-D-2024 ", "01/01/2024"),
            stored("2", "10-D-2024", "02/01/2024"),
        ]);
        let (index, row) = find_match("10-D-2024  ", &snapshot).expect("match");
        assert_eq!(index, 0);
        assert_eq!(row.id, "1");
        assert!(find_match("11-D-2024", &snapshot).is_none());
        assert!(find_match("10-D-2024", &StoreSnapshot::default()).is_none());
    }

    #[test]
    fn empty_store_appends_with_minimum_id() {
        let plan = reconcile(
            &[scraped("1234/24", "01/02/2024")],
            &StoreSnapshot::default(),
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.appends.len(), 1);
        assert!(plan.updates.is_empty());
        let row = &plan.appends[0];
        assert_eq!(row.id, "1");
        assert_eq!(row.case_id, "1234/24");
        assert_eq!(row.status, "");
        assert_eq!(row.probability, "");
        assert_eq!(row.notes, "");
        assert_eq!(plan.counts.new, 1);
        assert_eq!(plan.outcome(), PlanOutcome::Changes);
    }

    #[test]
    fn changed_start_date_updates_and_preserves_editor_fields() {
        let existing = StoreRow {
            status: "En comisión".into(),
            ..stored("7", "1234/24", "01/02/2024")
        };
        let snapshot = StoreSnapshot::from_rows(vec![existing.clone()]);
        let rec = scraped("1234/24", "05/03/2024");

        let plan = reconcile(&[rec.clone()], &snapshot, &IdentifierAllocator::plain("DIP-"))
            .unwrap();
        assert!(plan.appends.is_empty());
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.counts.updated, 1);

        let update = &plan.updates[0];
        assert_eq!(update.position, 2);
        let row = &update.row;
        assert_eq!(row.id, existing.id);
        assert_eq!(row.status, "En comisión");
        assert_eq!(row.probability, existing.probability);
        assert_eq!(row.notes, existing.notes);
        assert_eq!(row.start_date, "05/03/2024");
        assert_eq!(row.author, rec.author);
        assert_eq!(row.project_text, rec.project_text);
        assert_eq!(row.committees, rec.committees);
        assert_eq!(row.party, rec.party);
        assert_eq!(row.province, rec.province);
    }

    #[test]
    fn unchanged_start_date_is_skipped() {
        let snapshot = StoreSnapshot::from_rows(vec![stored("7", "1234/24", "01/02/2024")]);
        let plan = reconcile(
            &[scraped("1234/24", " 01/02/2024 ")],
            &snapshot,
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert!(plan.appends.is_empty());
        assert!(plan.updates.is_empty());
        assert_eq!(plan.counts.skipped, 1);
        assert_eq!(plan.outcome(), PlanOutcome::NothingToDo);
    }

    #[test]
    fn empty_scrape_reports_no_data() {
        let snapshot = StoreSnapshot::from_rows(vec![stored("7", "1234/24", "01/02/2024")]);
        let plan = reconcile(&[], &snapshot, &IdentifierAllocator::plain("DIP-")).unwrap();
        assert_eq!(plan.outcome(), PlanOutcome::NoData);
        assert_eq!(plan.counts, PlanCounts::default());
    }

    #[test]
    fn update_position_tracks_snapshot_index() {
        let snapshot = StoreSnapshot::from_rows(vec![
            stored("1", "1/24", "01/01/2024"),
            stored("2", "2/24", "01/01/2024"),
            stored("3", "3/24", "01/01/2024"),
        ]);
        let plan = reconcile(
            &[scraped("3/24", "09/09/2024")],
            &snapshot,
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.updates[0].position, 4);
    }

    #[test]
    fn duplicate_new_case_ids_in_one_run_both_append() {
        let snapshot = StoreSnapshot::from_rows(vec![stored("DIP-004", "1/24", "01/01/2024")]);
        let plan = reconcile(
            &[scraped("9/24", "01/01/2024"), scraped("9/24", "02/01/2024")],
            &snapshot,
            &IdentifierAllocator::prefixed("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.counts.new, 2);
        let ids: Vec<&str> = plan.appends.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["DIP-005", "DIP-006"]);
    }

    #[test]
    fn sentinel_case_id_is_matched_like_any_value() {
        let snapshot = StoreSnapshot::from_rows(vec![stored("1", NO_DATA, NO_DATA)]);
        let plan = reconcile(
            &[ScrapedRecord::no_data("Diputados")],
            &snapshot,
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.counts.skipped, 1);

        let plan = reconcile(
            &[ScrapedRecord::no_data("Diputados")],
            &StoreSnapshot::default(),
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.appends[0].case_id, NO_DATA);
    }

    #[test]
    fn missing_case_id_column_treats_every_record_as_new() {
        let table = SheetTable {
            headers: vec!["ID".into(), "Fecha de inicio".into()],
            rows: vec![vec!["12".into(), "01/01/2024".into()]],
        };
        let snapshot = StoreSnapshot::from_table(&table);
        let plan = reconcile(
            &[scraped("1/24", "01/01/2024")],
            &snapshot,
            &IdentifierAllocator::plain("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.counts.new, 1);
        assert_eq!(plan.appends[0].id, "13");
    }

    #[test]
    fn missing_id_column_starts_ids_at_minimum() {
        let table = SheetTable {
            headers: vec!["Expediente".into()],
            rows: vec![vec!["1/24".into()]],
        };
        let snapshot = StoreSnapshot::from_table(&table);
        let plan = reconcile(
            &[scraped("2/24", "01/01/2024")],
            &snapshot,
            &IdentifierAllocator::prefixed("DIP-"),
        )
        .unwrap();
        assert_eq!(plan.appends[0].id, "DIP-001");
    }

    /// Wraps a memory sheet and fails the `fail_on`-th row update.
    struct FailingUpdates {
        inner: MemorySheetStore,
        fail_on: usize,
        updates: Mutex<usize>,
        appends: Mutex<usize>,
    }

    #[async_trait]
    impl SheetStore for FailingUpdates {
        async fn read_table(&self) -> Result<SheetTable, StoreError> {
            self.inner.read_table().await
        }

        async fn append_rows(&self, rows: &[Vec<String>]) -> Result<(), StoreError> {
            *self.appends.lock().unwrap() += 1;
            self.inner.append_rows(rows).await
        }

        async fn update_row(&self, position: usize, cells: &[String]) -> Result<(), StoreError> {
            let attempt = {
                let mut updates = self.updates.lock().unwrap();
                *updates += 1;
                *updates
            };
            if attempt == self.fail_on {
                return Err(StoreError::Auth("token expired".into()));
            }
            self.inner.update_row(position, cells).await
        }
    }

    #[tokio::test]
    async fn store_error_stops_remaining_writes_and_keeps_earlier_ones() {
        let mut table = SheetTable::standard();
        for (id, case_id) in [("DIP-001", "1/24"), ("DIP-002", "2/24"), ("DIP-003", "3/24")] {
            table.rows.push(stored(id, case_id, "01/01/2024").to_cells());
        }
        let store = FailingUpdates {
            inner: MemorySheetStore::new(table),
            fail_on: 2,
            updates: Mutex::new(0),
            appends: Mutex::new(0),
        };
        let snapshot = StoreSnapshot::from_table(&store.read_table().await.unwrap());
        let plan = reconcile(
            &[
                scraped("1/24", "05/05/2024"),
                scraped("2/24", "05/05/2024"),
                scraped("3/24", "05/05/2024"),
                scraped("4/24", "05/05/2024"),
            ],
            &snapshot,
            &IdentifierAllocator::prefixed("DIP-"),
        )
        .unwrap();
        assert_eq!((plan.updates.len(), plan.appends.len()), (3, 1));

        let result = apply_plan(&store, &plan).await;
        assert!(matches!(result, Err(StoreError::Auth(_))));

        assert_eq!(*store.updates.lock().unwrap(), 2);
        assert_eq!(*store.appends.lock().unwrap(), 0);
        let table = store.inner.table().await;
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0][4], "05/05/2024");
        assert_eq!(table.rows[1][4], "01/01/2024");
        assert_eq!(table.rows[2][4], "01/01/2024");
    }

    #[tokio::test]
    async fn second_run_over_applied_plan_is_a_no_op() {
        let mut table = SheetTable::standard();
        table.rows.push(stored("DIP-001", "1/24", "01/01/2024").to_cells());
        let store = MemorySheetStore::new(table);
        let alloc = IdentifierAllocator::prefixed("DIP-");
        let scrape = vec![
            scraped("1/24", "03/03/2024"),
            scraped("2/24", "04/03/2024"),
        ];

        let snapshot = StoreSnapshot::from_table(&store.read_table().await.unwrap());
        let first = reconcile(&scrape, &snapshot, &alloc).unwrap();
        assert_eq!((first.counts.new, first.counts.updated), (1, 1));
        apply_plan(&store, &first).await.unwrap();

        let snapshot = StoreSnapshot::from_table(&store.read_table().await.unwrap());
        let second = reconcile(&scrape, &snapshot, &alloc).unwrap();
        assert!(second.appends.is_empty());
        assert!(second.updates.is_empty());
        assert_eq!(second.counts.skipped, 2);

        let table = store.table().await;
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][4], "03/03/2024");
        assert_eq!(table.rows[0][7], "En comisión");
        assert_eq!(table.rows[1][0], "DIP-002");
    }
}
