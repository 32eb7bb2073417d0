//! Behaviour every `EventDeadLetters` backend must share.

use event_bus::{EventDeadLetters, Group, InsertionId};
use std::sync::Arc;

use super::TestEvent;

pub type DeadLetters = Arc<dyn EventDeadLetters<TestEvent>>;

pub async fn store_then_load(dead_letters: DeadLetters) {
    let group = Group::new("audit");
    let event = TestEvent::new("stored");

    let id = dead_letters.store(&group, &event).await.unwrap();

    assert_eq!(
        dead_letters.failed_event(&group, id).await.unwrap(),
        Some(event)
    );
    assert_eq!(dead_letters.failed_ids(&group).await.unwrap(), vec![id]);
    assert!(dead_letters.contain_events().await.unwrap());
}

pub async fn ids_are_listed_oldest_first(dead_letters: DeadLetters) {
    let group = Group::new("audit");
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            dead_letters
                .store(&group, &TestEvent::new(format!("event-{i}")))
                .await
                .unwrap(),
        );
    }

    assert_eq!(dead_letters.failed_ids(&group).await.unwrap(), ids);
}

pub async fn same_event_stored_twice_gets_two_ids(dead_letters: DeadLetters) {
    let group = Group::new("audit");
    let event = TestEvent::new("twice");

    let first = dead_letters.store(&group, &event).await.unwrap();
    let second = dead_letters.store(&group, &event).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(dead_letters.failed_ids(&group).await.unwrap().len(), 2);
}

pub async fn remove_is_scoped_and_idempotent(dead_letters: DeadLetters) {
    let audit = Group::new("audit");
    let billing = Group::new("billing");
    let kept = dead_letters.store(&audit, &TestEvent::new("kept")).await.unwrap();
    let removed = dead_letters.store(&audit, &TestEvent::new("removed")).await.unwrap();
    let other = dead_letters.store(&billing, &TestEvent::new("other")).await.unwrap();

    dead_letters.remove(&audit, removed).await.unwrap();
    dead_letters.remove(&audit, removed).await.unwrap();
    // wrong group: no effect
    dead_letters.remove(&audit, other).await.unwrap();
    dead_letters.remove(&audit, InsertionId::random()).await.unwrap();

    assert_eq!(dead_letters.failed_ids(&audit).await.unwrap(), vec![kept]);
    assert_eq!(dead_letters.failed_event(&audit, removed).await.unwrap(), None);
    assert_eq!(dead_letters.failed_ids(&billing).await.unwrap(), vec![other]);
}

pub async fn groups_with_failed_events_tracks_content(dead_letters: DeadLetters) {
    let audit = Group::new("audit");
    let billing = Group::new("billing");
    assert!(dead_letters.groups_with_failed_events().await.unwrap().is_empty());
    assert!(!dead_letters.contain_events().await.unwrap());

    let id = dead_letters.store(&audit, &TestEvent::new("a")).await.unwrap();
    dead_letters.store(&billing, &TestEvent::new("b")).await.unwrap();
    assert_eq!(
        dead_letters.groups_with_failed_events().await.unwrap(),
        vec![audit.clone(), billing.clone()]
    );

    dead_letters.remove(&audit, id).await.unwrap();
    assert_eq!(
        dead_letters.groups_with_failed_events().await.unwrap(),
        vec![billing.clone()]
    );

    dead_letters.remove_group(&billing).await.unwrap();
    assert!(dead_letters.groups_with_failed_events().await.unwrap().is_empty());
    assert!(!dead_letters.contain_events().await.unwrap());
}

pub async fn unknown_entries_are_absent(dead_letters: DeadLetters) {
    let group = Group::new("unknown");
    assert_eq!(
        dead_letters
            .failed_event(&group, InsertionId::random())
            .await
            .unwrap(),
        None
    );
    assert!(dead_letters.failed_ids(&group).await.unwrap().is_empty());
    dead_letters.remove_group(&group).await.unwrap();
}
