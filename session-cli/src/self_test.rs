//! Two in-memory engines exchanging pairwise and group traffic end to end.

use anyhow::{Context, Result, ensure};
use double_ratchets::BackendKind;
use session_engine::{
    BatchOutcome, EncryptedRoomEvent, EngineConfig, RemoteDevice, SessionEngine, ToDeviceEvent,
};
use tracing::info;

const ROOM: &str = "!self-test:localhost";

fn open(user_id: &str, device_id: &str, backend: BackendKind) -> Result<SessionEngine> {
    let config = EngineConfig {
        account_id: format!("{user_id}/{device_id}"),
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        backend,
        pickle_key: format!("self-test {device_id}"),
        ..EngineConfig::default()
    };
    SessionEngine::open(&config).with_context(|| format!("failed to open engine for {user_id}"))
}

fn device(engine: &SessionEngine, one_time_key: bool) -> Result<RemoteDevice> {
    let one_time_key = if one_time_key {
        engine.generate_one_time_keys(1)?.pop()
    } else {
        None
    };
    Ok(RemoteDevice {
        user_id: engine.user_id().to_string(),
        device_id: engine.device_id().to_string(),
        identity_key: engine.identity_key(),
        one_time_key,
    })
}

pub fn run(backend: BackendKind) -> Result<()> {
    info!(%backend, "starting self-test");
    let alice = open("@alice:localhost", "ALICE", backend)?;
    let bob = open("@bob:localhost", "BOB", backend)?;

    // Pairwise: pre-key message, then a reply on the same session.
    let hello = alice.encrypt_pairwise(&device(&bob, true)?, b"hello")?;
    let received = bob.decrypt_pairwise(&alice.identity_key(), &hello)?;
    ensure!(received == b"hello", "pairwise plaintext mismatch");
    let reply = bob.encrypt_pairwise(&device(&alice, false)?, b"world")?;
    let received = alice.decrypt_pairwise(&bob.identity_key(), &reply)?;
    ensure!(received == b"world", "pairwise reply mismatch");
    info!("pairwise exchange ok");

    // Group: the event arrives before the key, so it is queued and retried.
    let session_id = alice.rotate_outbound_group_session(ROOM)?;
    let shared = alice.share_group_session(ROOM, &[device(&bob, false)?])?;
    let message = alice.encrypt_group(ROOM, b"group hello")?;
    let event = EncryptedRoomEvent {
        room_id: message.room_id,
        event_id: "$self-test".to_string(),
        sender_key: message.sender_key,
        session_id: message.session_id,
        ciphertext: message.ciphertext,
        timestamp: 0,
    };

    let mut outcome = BatchOutcome::default();
    let early = bob.decrypt_room_events(std::slice::from_ref(&event), &mut outcome);
    ensure!(early.is_empty(), "decrypted before the key arrived");
    ensure!(outcome.wakeup_request_queue, "missing key was not queued");

    let delivered = bob.handle_to_device_batch(
        shared
            .into_iter()
            .map(|message| ToDeviceEvent::Encrypted {
                sender_key: message.sender_key,
                ciphertext: message.ciphertext,
            })
            .collect(),
    );
    ensure!(
        delivered.installed_sessions == [session_id.clone()],
        "room key was not installed: {:?}",
        delivered.failures
    );
    ensure!(bob.retry_queue().is_empty(), "key request still pending");

    let decrypted = bob.decrypt_group(&event)?;
    ensure!(decrypted.plaintext == b"group hello", "group plaintext mismatch");
    info!(session_id = %session_id, "group exchange ok");

    info!("self-test passed");
    Ok(())
}
