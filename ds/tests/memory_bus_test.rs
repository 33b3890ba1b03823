use std::sync::mpsc::TryRecvError;

use ds::{DeliveryService, MemoryDeliveryService};

#[tokio::test]
async fn test_broadcast_reaches_every_matching_subscriber() {
    let bus = MemoryDeliveryService::new();
    let first = bus.subscribe(b"group::").unwrap();
    let second = bus.clone().subscribe(b"group::").unwrap();
    let other = bus.subscribe(b"other::").unwrap();

    bus.publish(b"group::payload".to_vec()).await.unwrap();

    assert_eq!(first.try_recv().unwrap(), b"group::payload".to_vec());
    assert_eq!(second.try_recv().unwrap(), b"group::payload".to_vec());
    assert_eq!(other.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_empty_subscription_does_not_block() {
    let bus = MemoryDeliveryService::new();
    let rx = bus.subscribe(b"nobody::").unwrap();
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn test_loss_filter_drops_frames() {
    let bus = MemoryDeliveryService::new();
    let rx = bus.subscribe(b"").unwrap();
    bus.set_loss_filter(Some(Box::new(|frame: &[u8]| frame.ends_with(b"lost"))));

    bus.publish(b"kept".to_vec()).await.unwrap();
    bus.publish(b"this one is lost".to_vec()).await.unwrap();

    assert_eq!(rx.try_recv().unwrap(), b"kept".to_vec());
    assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

    bus.set_loss_filter(None);
    bus.publish(b"no longer lost".to_vec()).await.unwrap();
    assert_eq!(rx.try_recv().unwrap(), b"no longer lost".to_vec());
}
