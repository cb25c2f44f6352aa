use super::*;
use crate::test_support::{record, FakeChatApi};
use shared::{domain::MessageId, protocol::MessageRecord};

#[tokio::test]
async fn load_converts_records_in_server_order() {
    let api = Arc::new(FakeChatApi::with_history(vec![
        record(Some("1"), "a", "hi"),
        record(Some("2"), "b", "yo"),
    ]));
    let loader = HistoryLoader::new(api);

    let snapshot = loader.load(&Session::empty()).await.expect("load");

    let ids: Vec<_> = snapshot
        .messages
        .iter()
        .map(|message| message.id.clone())
        .collect();
    assert_eq!(ids, vec![Some(MessageId::new("1")), Some(MessageId::new("2"))]);
    assert!(snapshot
        .messages
        .iter()
        .all(|message| message.origin == Origin::History));
    assert!(snapshot.rejected.is_empty());
}

#[tokio::test]
async fn malformed_records_are_skipped() {
    let api = Arc::new(FakeChatApi::with_history(vec![
        record(Some("1"), "a", "hi"),
        MessageRecord {
            text: Some("no sender".into()),
            ..MessageRecord::default()
        },
        record(Some("3"), "c", "  "),
    ]));
    let loader = HistoryLoader::new(api);

    let snapshot = loader.load(&Session::empty()).await.expect("load");

    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(
        snapshot.rejected,
        vec![ValidationError::MissingSender, ValidationError::EmptyText]
    );
}

#[tokio::test]
async fn transport_failure_is_reported_and_repeatable() {
    let api = Arc::new(FakeChatApi::default());
    api.set_history_failure(Some(HistoryLoadError::Status { status: 502 }));
    let loader = HistoryLoader::new(Arc::clone(&api) as Arc<dyn ChatApi>);

    assert_eq!(
        loader.load(&Session::empty()).await,
        Err(HistoryLoadError::Status { status: 502 })
    );

    api.set_history_failure(None);
    api.push_history(record(Some("1"), "a", "back"));
    let snapshot = loader.load(&Session::empty()).await.expect("retry");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(api.fetches(), 2);
}
