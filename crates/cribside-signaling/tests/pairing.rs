//! Pairing flow across process restarts: token import is one-shot and
//! the stored key survives reopening the store.

use std::fs;
use std::path::PathBuf;

use cribside_signaling::psk::{FileImportChannel, KeyRole, KeyStore, MIN_KEY_BYTES};
use cribside_signaling::KeyDecision;

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir()
        .join("cribside-tests")
        .join(format!("{}-{}", name, uuid::Uuid::new_v4()))
}

#[test]
fn import_survives_reload_and_scrubs_the_channel() {
    let store_path = temp_path("keys");
    let pair_path = temp_path("pair");
    fs::create_dir_all(pair_path.parent().unwrap()).unwrap();

    // Fragment as produced by the camera side.
    let mut camera = KeyStore::open_at(temp_path("camera-keys")).unwrap();
    let camera_key = camera.ensure_key("Baby", KeyRole::Sender).unwrap().unwrap();
    let fragment = camera.share_fragment("Baby").unwrap();
    fs::write(&pair_path, &fragment).unwrap();

    let mut store = KeyStore::open_at(&store_path).unwrap();
    let mut channel = FileImportChannel::new(&pair_path);
    let room = store.import(&mut channel, "Baby").unwrap();
    assert_eq!(room.as_deref(), Some("Baby"));
    assert!(!pair_path.exists(), "token is single-use");

    // "Restart": a fresh store over the same file still has the key,
    // and the scrubbed channel yields nothing.
    let mut reopened = KeyStore::open_at(&store_path).unwrap();
    let key = reopened.key_for("Baby").expect("key persisted");
    assert_eq!(key.bytes(), camera_key.bytes());
    assert_eq!(key.bytes().len(), MIN_KEY_BYTES);

    let mut empty_channel = FileImportChannel::new(&pair_path);
    assert!(reopened.import(&mut empty_channel, "Baby").unwrap().is_none());
}

#[test]
fn invalid_token_leaves_the_channel_intact() {
    let pair_path = temp_path("pair-bad");
    fs::create_dir_all(pair_path.parent().unwrap()).unwrap();
    fs::write(&pair_path, "room=Baby&token=dG9vc2hvcnQ").unwrap();

    let mut store = KeyStore::open_at(temp_path("keys-bad")).unwrap();
    let mut channel = FileImportChannel::new(&pair_path);
    assert!(store.import(&mut channel, "Baby").is_err());
    assert!(pair_path.exists(), "failed import must not consume the token");
    assert!(store.valid_rooms().is_empty());
}

#[test]
fn receiver_requires_pairing_for_unknown_rooms() {
    let mut store = KeyStore::open_at(temp_path("keys-unpaired")).unwrap();
    match store.require_key("viewer", Some("Baby"), "Baby").unwrap() {
        KeyDecision::NeedsPairing { room, intent } => {
            assert_eq!(room, "Baby");
            assert_eq!(intent, "viewer");
        }
        KeyDecision::Ready { .. } => panic!("no key should exist yet"),
    }
}
