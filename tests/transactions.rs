#[path = "../src/test_support.rs"]
mod test_support;

use provmerge::transaction::TransactionState;
use provmerge::{
    LedgerStore, LoadType, MergeError, RecordId, RecordStore, StoreKind, Transactional, Value,
};
use test_support::{
    build_reconciler, default_priorities, default_reconciler, gene, FailureSwitch, Failures,
    FlakyLedger, FlakyStore,
};

fn flaky_reconciler() -> (provmerge::Reconciler, FailureSwitch, FailureSwitch) {
    let primary_switch = FailureSwitch::default();
    let ledger_switch = FailureSwitch::default();
    let reconciler = build_reconciler(
        Box::new(FlakyStore::new(primary_switch.clone())),
        Box::new(FlakyLedger::new(ledger_switch.clone())),
        default_priorities(),
    );
    (reconciler, primary_switch, ledger_switch)
}

#[test]
fn abort_rolls_back_both_stores() {
    let mut reconciler = default_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    let id = reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record
        .id
        .unwrap();
    assert_eq!(reconciler.transaction_state(), TransactionState::Active);
    reconciler.abort_transaction().unwrap();

    assert!(reconciler.primary().is_empty());
    assert_eq!(reconciler.provenance(id, "name").unwrap(), None);
    assert_eq!(reconciler.transaction_state(), TransactionState::Idle);
}

#[test]
fn abort_forgets_remaps_made_in_the_transaction() {
    let mut reconciler = default_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    let aborted = reconciler
        .store_record(&gene("eve", "even skipped").with_id(RecordId(50)), &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record
        .id
        .unwrap();
    reconciler.abort_transaction().unwrap();
    assert!(reconciler.remap().is_empty());
    assert!(reconciler.primary().is_empty());

    // the rolled-back id is handed out again to an unrelated record
    reconciler.begin_transaction().unwrap();
    let reused = reconciler
        .store_record(&gene("ftz", "fushi tarazu"), &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record
        .id
        .unwrap();
    assert_eq!(reused, aborted);
    let referencing = gene("h", "hairy").with_scalar("chromosome", Value::Ref(RecordId(50)));
    let merged = reconciler
        .store_record(&referencing, &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record;
    reconciler.commit_transaction().unwrap();
    assert_eq!(merged.scalar("chromosome"), Some(&Value::Ref(RecordId(50))));
}

#[test]
fn committed_remaps_survive_a_later_abort() {
    let mut reconciler = default_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    let kept = reconciler
        .store_record(&gene("eve", "even skipped").with_id(RecordId(7)), &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record
        .id
        .unwrap();
    reconciler.commit_transaction().unwrap();

    reconciler.begin_transaction().unwrap();
    reconciler
        .store_record(&gene("ftz", "fushi tarazu").with_id(RecordId(8)), &genbank, &skeleton, LoadType::Source)
        .unwrap();
    reconciler.abort_transaction().unwrap();

    assert_eq!(reconciler.remap().entries(), vec![(RecordId(7), kept)]);
}

#[test]
fn writes_outside_a_transaction_keep_no_fresh_overlay() {
    let mut reconciler = default_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    for i in 0..1000 {
        reconciler
            .store_record(&gene(&format!("g{i:04}"), "gene"), &genbank, &skeleton, LoadType::Source)
            .unwrap();
    }
    assert_eq!(reconciler.primary().len(), 1000);
    assert_eq!(reconciler.ledger().fresh_count(), 0);

    // inside a transaction the overlay is used and released on commit
    reconciler.begin_transaction().unwrap();
    reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap();
    assert_eq!(reconciler.ledger().fresh_count(), 1);
    reconciler.commit_transaction().unwrap();
    assert_eq!(reconciler.ledger().fresh_count(), 0);
}

#[test]
fn sources_created_in_aborted_transaction_are_recreated() {
    let mut reconciler = default_reconciler();
    reconciler.begin_transaction().unwrap();
    let ensembl = reconciler.main_source("Ensembl").unwrap();
    reconciler.abort_transaction().unwrap();

    assert!(reconciler
        .ledger()
        .store()
        .source_by_key("Ensembl", false)
        .unwrap()
        .is_none());
    assert_eq!(reconciler.main_source("Ensembl").unwrap().name, ensembl.name);
}

#[test]
fn ledger_begin_failure_releases_primary() {
    let (mut reconciler, _primary, ledger) = flaky_reconciler();
    ledger.set(Failures {
        begin: true,
        ..Failures::default()
    });

    let err = reconciler.begin_transaction().unwrap_err();
    assert_eq!(err.store_kind(), Some(StoreKind::Ledger));
    assert!(!reconciler.primary().is_in_transaction());

    ledger.set(Failures::default());
    reconciler.begin_transaction().unwrap();
    reconciler.commit_transaction().unwrap();
}

#[test]
fn ledger_commit_failure_is_reported_after_primary_commit() {
    let (mut reconciler, _primary, ledger) = flaky_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap();
    ledger.set(Failures {
        commit: true,
        ..Failures::default()
    });

    let err = reconciler.commit_transaction().unwrap_err();
    assert_eq!(err.store_kind(), Some(StoreKind::Ledger));
    // the primary store already committed; the stores have diverged
    assert!(!reconciler.primary().is_in_transaction());
    assert_eq!(reconciler.primary().len(), 1);
}

#[test]
fn primary_write_failure_names_the_primary_store() {
    let (mut reconciler, primary, _ledger) = flaky_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    primary.set(Failures {
        write: true,
        ..Failures::default()
    });
    let err = reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap_err();
    match err {
        MergeError::Store {
            store, operation, ..
        } => {
            assert_eq!(store, StoreKind::Primary);
            assert_eq!(operation, "store");
        }
        other => panic!("unexpected error: {other}"),
    }

    primary.set(Failures::default());
    reconciler.abort_transaction().unwrap();
    assert!(reconciler.primary().is_empty());
}

#[test]
fn ledger_write_failure_names_the_ledger() {
    let (mut reconciler, _primary, ledger) = flaky_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    ledger.set(Failures {
        write: true,
        ..Failures::default()
    });
    let err = reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap_err();
    assert_eq!(err.store_kind(), Some(StoreKind::Ledger));

    ledger.set(Failures::default());
    reconciler.abort_transaction().unwrap();
    assert!(reconciler.primary().is_empty());
}

#[test]
fn abort_reaches_ledger_when_primary_abort_fails() {
    let (mut reconciler, primary, _ledger) = flaky_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.begin_transaction().unwrap();
    let id = reconciler
        .store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source)
        .unwrap()
        .record
        .id
        .unwrap();
    primary.set(Failures {
        abort: true,
        ..Failures::default()
    });

    let err = reconciler.abort_transaction().unwrap_err();
    assert_eq!(err.store_kind(), Some(StoreKind::Primary));
    assert_eq!(reconciler.provenance(id, "name").unwrap(), None);
}

#[test]
fn closed_reconciler_rejects_work() {
    let mut reconciler = default_reconciler();
    let genbank = reconciler.main_source("GenBank").unwrap();
    let skeleton = reconciler.skeleton_source("GenBank").unwrap();

    reconciler.close().unwrap();
    reconciler.close().unwrap();
    assert_eq!(reconciler.transaction_state(), TransactionState::Closed);

    assert!(matches!(
        reconciler.store_record(&gene("eve", "even skipped"), &genbank, &skeleton, LoadType::Source),
        Err(MergeError::Closed)
    ));
    assert!(matches!(reconciler.begin_transaction(), Err(MergeError::Closed)));
    assert!(matches!(reconciler.main_source("RefSeq"), Err(MergeError::Closed)));
}
