mod common;

use std::sync::Arc;

use common::{
    account, exchange_device_lists, jid, test_config, CollectingSink, EmptyRoster,
    LoopbackTransport, PubSubServer,
};
use omemo_core::{
    DeviceList, Incoming, KeyStore, OmemoEngine, OmemoEvent, Outgoing, PubSubEvent,
};

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_devices_are_skipped() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let bob = account(&server, "bob@example.org").await;
    exchange_device_lists(&server, &[&alice, &bob]).await;

    // Bob's list claims an extra device that never published a bundle.
    alice
        .engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: bob.jid.clone(),
            list: DeviceList {
                devices: vec![bob.engine.own_device_id(), 424_242],
            },
        })
        .await
        .unwrap();

    alice
        .engine
        .set_encryption_enabled(&bob.jid, true)
        .await
        .unwrap();
    let cipher = match alice
        .engine
        .encrypt_message(&bob.jid, "best effort")
        .await
        .unwrap()
    {
        Outgoing::Encrypted(cipher) => cipher,
        Outgoing::Plaintext(_) => unreachable!(),
    };
    assert!(cipher.key_for(bob.engine.own_device_id()).is_some());
    assert!(cipher.key_for(424_242).is_none());
    assert!(matches!(
        bob.engine.handle_message(&alice.jid, &cipher).await.unwrap(),
        Incoming::Message { .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn own_device_id_is_restored_on_the_list() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let own_id = alice.engine.own_device_id();

    // Another client overwrote the list without our device id.
    alice
        .engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: alice.jid.clone(),
            list: DeviceList { devices: vec![77] },
        })
        .await
        .unwrap();

    let published = server.published_device_list(&alice.jid).unwrap();
    assert!(published.devices.contains(&own_id));
    assert!(published.devices.contains(&77));
}

#[tokio::test(flavor = "multi_thread")]
async fn list_updates_emit_an_event() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let peer = jid("peer@example.org");
    alice.sink.take();

    alice
        .engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: peer.clone(),
            list: DeviceList {
                devices: vec![5, 6],
            },
        })
        .await
        .unwrap();

    let events = alice.sink.take();
    assert!(events.iter().any(
        |e| matches!(e, OmemoEvent::DeviceListChanged { jid, devices }
            if *jid == peer && *devices == vec![5, 6])
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn lists_from_unsubscribed_contacts_are_ignored() {
    let server = PubSubServer::new();
    let sink = CollectingSink::new();
    let me = jid("loner@example.org");
    let store = KeyStore::open_in_memory(true).unwrap();
    let transport = Arc::new(LoopbackTransport::new(server.clone(), me.clone()));
    let engine = OmemoEngine::with_store(
        store,
        me,
        transport,
        Arc::new(EmptyRoster),
        sink.clone(),
        test_config(),
    )
    .await
    .unwrap();
    engine.start().await.unwrap();
    sink.take();

    engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: jid("stranger@example.org"),
            list: DeviceList { devices: vec![1] },
        })
        .await
        .unwrap();
    assert!(sink
        .take()
        .iter()
        .all(|e| !matches!(e, OmemoEvent::DeviceListChanged { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn list_receipt_builds_sessions_eagerly() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let bob = account(&server, "bob@example.org").await;
    alice.sink.take();

    let list = server.published_device_list(&bob.jid).unwrap();
    alice
        .engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: bob.jid.clone(),
            list,
        })
        .await
        .unwrap();
    assert!(alice
        .sink
        .take()
        .iter()
        .any(|e| matches!(e, OmemoEvent::SessionBuilt { jid, .. } if *jid == bob.jid)));

    // The session is in place, so sending needs no bundle fetch.
    server.delete_bundle(&bob.jid, bob.engine.own_device_id());
    alice
        .engine
        .set_encryption_enabled(&bob.jid, true)
        .await
        .unwrap();
    assert!(matches!(
        alice
            .engine
            .encrypt_message(&bob.jid, "no fetch needed")
            .await
            .unwrap(),
        Outgoing::Encrypted(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_fetches_are_parked_and_retried() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let bob = account(&server, "bob@example.org").await;
    let bob_device = bob.engine.own_device_id();

    let bundle = server.published_bundle(&bob.jid, bob_device).unwrap();
    server.delete_bundle(&bob.jid, bob_device);

    let list = server.published_device_list(&bob.jid).unwrap();
    alice
        .engine
        .handle_pubsub_event(PubSubEvent::DeviceList {
            from: bob.jid.clone(),
            list,
        })
        .await
        .unwrap();
    assert_eq!(
        alice.engine.missing_bundles(&bob.jid).await,
        vec![bob_device]
    );

    // The bundle reappears; an explicit retry picks it up.
    server.publish_bundle_for(&bob.jid, bob_device, bundle);
    alice.engine.retry_missing_bundles(&bob.jid).await.unwrap();
    assert!(alice.engine.missing_bundles(&bob.jid).await.is_empty());

    alice
        .engine
        .set_encryption_enabled(&bob.jid, true)
        .await
        .unwrap();
    assert!(matches!(
        alice
            .engine
            .encrypt_message(&bob.jid, "finally")
            .await
            .unwrap(),
        Outgoing::Encrypted(_)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_survive_a_device_list_flap() {
    let server = PubSubServer::new();
    let alice = account(&server, "alice@example.org").await;
    let bob = account(&server, "bob@example.org").await;
    exchange_device_lists(&server, &[&alice, &bob]).await;

    // Complete a handshake in both directions.
    alice
        .engine
        .set_encryption_enabled(&bob.jid, true)
        .await
        .unwrap();
    bob.engine
        .set_encryption_enabled(&alice.jid, true)
        .await
        .unwrap();
    let first = match alice.engine.encrypt_message(&bob.jid, "one").await.unwrap() {
        Outgoing::Encrypted(c) => c,
        Outgoing::Plaintext(_) => unreachable!(),
    };
    bob.engine.handle_message(&alice.jid, &first).await.unwrap();
    let reply = match bob.engine.encrypt_message(&alice.jid, "two").await.unwrap() {
        Outgoing::Encrypted(c) => c,
        Outgoing::Plaintext(_) => unreachable!(),
    };
    alice.engine.handle_message(&bob.jid, &reply).await.unwrap();

    // Bob's device vanishes from the list and comes back.
    for devices in [vec![], vec![bob.engine.own_device_id()]] {
        alice
            .engine
            .handle_pubsub_event(PubSubEvent::DeviceList {
                from: bob.jid.clone(),
                list: DeviceList { devices },
            })
            .await
            .unwrap();
    }

    // The old ratchet continues; no new handshake needed.
    let third = match alice
        .engine
        .encrypt_message(&bob.jid, "three")
        .await
        .unwrap()
    {
        Outgoing::Encrypted(c) => c,
        Outgoing::Plaintext(_) => unreachable!(),
    };
    assert!(third.keys.iter().all(|k| !k.is_prekey));
    assert!(matches!(
        bob.engine.handle_message(&alice.jid, &third).await.unwrap(),
        Incoming::Message { plaintext, .. } if plaintext == "three"
    ));
}
