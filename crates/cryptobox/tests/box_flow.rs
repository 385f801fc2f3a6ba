//! Integration tests for the complete box lifecycle.
//!
//! Every box lives in its own temp directory and uses the real file store,
//! so these cover persistence across close and reopen as well.

use std::sync::Arc;
use std::thread;

use cryptobox::{fingerprint_prekey, BoxError, CryptoBox, CryptoError, IdentityMode, LAST_PREKEY_ID};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    cbox: CryptoBox,
    bundles: Vec<Vec<u8>>,
}

/// A box over a fresh directory with ten prekeys (ids 0..10).
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let cbox = CryptoBox::open(dir.path()).expect("open fresh box");
    let bundles = cbox
        .new_prekeys(0, 10)
        .expect("generate prekeys")
        .iter()
        .map(|b| b.serialize())
        .collect();
    Fixture { dir, cbox, bundles }
}

fn crypto_error(err: BoxError) -> CryptoError {
    match err {
        BoxError::Crypto(e) => e,
        other => panic!("expected a crypto error, got {other:?}"),
    }
}

// ── Encrypt / Decrypt ────────────────────────────────────────────────

#[test]
fn encrypt_decrypt_between_two_boxes() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap();
    let hello_bob = "Hello Bøb!".as_bytes();
    let cipher = alice.encrypt(hello_bob).unwrap();
    assert_ne!(cipher.as_slice(), hello_bob);

    let (bob, plaintext) = bob_box.cbox.session_from_message("bob", &cipher).unwrap();
    assert_eq!(plaintext, hello_bob);

    alice.save().unwrap();
    bob.save().unwrap();

    assert_eq!(alice.id(), "alice");
    assert_eq!(bob.id(), "bob");

    // Lookups return the very same handle.
    assert!(Arc::ptr_eq(&alice_box.cbox.get_session("alice").unwrap(), &alice));
    assert!(Arc::ptr_eq(&bob_box.cbox.get_session("bob").unwrap(), &bob));

    assert_eq!(
        alice_box.cbox.local_fingerprint().unwrap(),
        bob.remote_fingerprint().unwrap()
    );
    assert_eq!(
        bob_box.cbox.local_fingerprint().unwrap(),
        alice.remote_fingerprint().unwrap()
    );
    assert_eq!(alice.local_fingerprint().unwrap(), alice_box.cbox.local_fingerprint().unwrap());

    let reply = bob.encrypt(b"Hello Alice!").unwrap();
    assert_eq!(alice.decrypt(&reply).unwrap(), b"Hello Alice!");
}

#[test]
fn same_plaintext_never_repeats_and_decrypts_once() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("bob", &bob_box.bundles[1])
        .unwrap();
    let first = alice.encrypt(b"ping").unwrap();
    let second = alice.encrypt(b"ping").unwrap();
    assert_ne!(first, second);

    let (bob, _) = bob_box.cbox.session_from_message("alice", &first).unwrap();
    assert_eq!(bob.decrypt(&second).unwrap(), b"ping");

    let err = crypto_error(bob.decrypt(&second).unwrap_err());
    assert!(matches!(err, CryptoError::DuplicateMessage));
    assert_eq!(err.code(), 7);
}

#[test]
fn out_of_order_and_outdated_messages() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("bob", &bob_box.bundles[2])
        .unwrap();
    let (bob, _) = bob_box
        .cbox
        .session_from_message("alice", &alice.encrypt(b"hi").unwrap())
        .unwrap();
    alice.decrypt(&bob.encrypt(b"hi back").unwrap()).unwrap();

    let messages: Vec<_> = (0..5u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();
    for i in [4, 0, 3, 1, 2] {
        assert_eq!(bob.decrypt(&messages[i]).unwrap(), vec![i as u8]);
    }

    let garbage = crypto_error(bob.decrypt(b"\x01\x01short").unwrap_err());
    assert!(matches!(garbage, CryptoError::DecodeError(_)));
}

// ── PreKeys ──────────────────────────────────────────────────────────

#[test]
fn prekey_ids_wrap_around() {
    let alice_box = fixture();
    let ids: Vec<_> = alice_box
        .cbox
        .new_prekeys(0xFFFC, 5)
        .unwrap()
        .iter()
        .map(|b| b.prekey_id)
        .collect();
    assert_eq!(ids, vec![0xFFFC, 0xFFFD, 0xFFFE, 0x0000, 0x0001]);
}

#[test]
fn last_prekey_serves_many_peers() {
    let bob_box = fixture();
    let last = bob_box.cbox.new_last_prekey().unwrap();
    assert_eq!(last.prekey_id, LAST_PREKEY_ID);
    let last = last.serialize();

    for peer in ["carol", "dave", "erin"] {
        let peer_box = fixture();
        let session = peer_box.cbox.session_from_prekey("bob", &last).unwrap();
        let hello = format!("hello from {peer}");
        let cipher = session.encrypt(hello.as_bytes()).unwrap();

        let (bob, plaintext) = bob_box.cbox.session_from_message(peer, &cipher).unwrap();
        assert_eq!(plaintext, hello.as_bytes());
        bob.save().unwrap();
        assert_eq!(bob.remote_fingerprint().unwrap(), peer_box.cbox.local_fingerprint().unwrap());
    }

    assert!(bob_box.dir.path().join("prekeys").join("65535").exists());
    assert_eq!(bob_box.cbox.new_last_prekey().unwrap().serialize(), last);
}

#[test]
fn same_last_resort_message_under_fresh_ids() {
    let alice_box = fixture();
    let bob_box = fixture();
    let last = bob_box.cbox.new_last_prekey().unwrap().serialize();

    let alice = alice_box.cbox.session_from_prekey("alice", &last).unwrap();
    let cipher = alice.encrypt("Hello Bøb!".as_bytes()).unwrap();
    for sid in ["bob-1", "bob-2", "bob-3"] {
        let (bob, plaintext) = bob_box.cbox.session_from_message(sid, &cipher).unwrap();
        assert_eq!(plaintext, "Hello Bøb!".as_bytes());
        bob.save().unwrap();
    }
}

#[test]
fn one_time_prekey_is_deleted_when_the_session_is_saved() {
    let alice_box = fixture();
    let bob_box = fixture();
    let prekey_file = bob_box.dir.path().join("prekeys").join("3");
    assert!(prekey_file.exists());

    let alice = alice_box
        .cbox
        .session_from_prekey("bob", &bob_box.bundles[3])
        .unwrap();
    let (bob, _) = bob_box
        .cbox
        .session_from_message("alice", &alice.encrypt(b"hi").unwrap())
        .unwrap();
    assert!(prekey_file.exists());

    bob.save().unwrap();
    assert!(!prekey_file.exists());
}

#[test]
fn bundle_fingerprint_names_its_owner() {
    let bob_box = fixture();
    assert_eq!(
        fingerprint_prekey(&bob_box.bundles[0]).unwrap(),
        bob_box.cbox.local_fingerprint().unwrap()
    );
}

// ── Handle lifecycle ─────────────────────────────────────────────────

#[test]
fn closed_session_fails_fast() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap();
    alice.encrypt(b"Hello").unwrap();

    alice_box.cbox.close_session(&alice).unwrap();
    assert!(alice.is_closed());
    assert!(matches!(alice.encrypt(b"Hello"), Err(BoxError::SessionClosed)));
    assert!(matches!(alice.decrypt(b"x"), Err(BoxError::SessionClosed)));
    assert!(matches!(alice.save(), Err(BoxError::SessionClosed)));
    assert!(matches!(alice.remote_fingerprint(), Err(BoxError::SessionClosed)));

    // Never saved, so there is nothing to reopen.
    assert!(alice_box.cbox.try_get_session("alice").unwrap().is_none());
    // Closing twice is harmless.
    alice_box.cbox.close_session(&alice).unwrap();
}

#[test]
fn closed_box_fails_fast() {
    let alice_box = fixture();
    let bob_box = fixture();
    let alice = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap();

    alice_box.cbox.close();
    assert!(alice_box.cbox.is_closed());
    assert!(alice.is_closed());

    let err = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap_err();
    assert!(matches!(err, BoxError::BoxClosed));
    assert!(err.crypto().is_none());
    assert!(matches!(alice_box.cbox.get_session("alice"), Err(BoxError::BoxClosed)));
    assert!(matches!(alice_box.cbox.local_fingerprint(), Err(BoxError::BoxClosed)));
    assert!(matches!(alice_box.cbox.new_prekeys(0, 1), Err(BoxError::BoxClosed)));
    assert!(matches!(alice.encrypt(b"x"), Err(BoxError::SessionClosed)));

    // Closing again is a no-op.
    alice_box.cbox.close();
}

#[test]
fn saved_session_survives_reopen() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("bob", &bob_box.bundles[0])
        .unwrap();
    let (bob, _) = bob_box
        .cbox
        .session_from_message("alice", &alice.encrypt(b"one").unwrap())
        .unwrap();
    bob.save().unwrap();
    alice.save().unwrap();

    let Fixture { dir, cbox, .. } = bob_box;
    cbox.close();
    let reopened = CryptoBox::open(dir.path()).unwrap();
    let bob = reopened.get_session("alice").unwrap();
    assert_eq!(bob.decrypt(&alice.encrypt(b"two").unwrap()).unwrap(), b"two");
    assert_eq!(reopened.session_ids().unwrap(), vec!["alice".to_owned()]);

    let missing = crypto_error(reopened.get_session("nobody").unwrap_err());
    assert!(matches!(missing, CryptoError::SessionNotFound(_)));
}

#[test]
fn delete_session_then_reinitialise() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap();
    let hello_bob = alice.encrypt(b"Hello Bob!").unwrap();
    alice.save().unwrap();

    let (bob, _) = bob_box.cbox.session_from_message("bob", &hello_bob).unwrap();

    // Alice loses her session.
    alice_box.cbox.close_session(&alice).unwrap();
    let alice = alice_box.cbox.get_session("alice").unwrap();
    alice_box.cbox.delete_session(alice.id()).unwrap();
    assert!(alice.is_closed());
    assert!(alice_box.cbox.try_get_session("alice").unwrap().is_none());

    // Without state, Bob's reply cannot start a session.
    let hello_alice = bob.encrypt(b"Hello Alice!").unwrap();
    let err = crypto_error(
        alice_box
            .cbox
            .session_from_message("alice", &hello_alice)
            .unwrap_err(),
    );
    assert!(matches!(err, CryptoError::InvalidMessage(_)));

    // Alice starts over with the prekey Bob already used.
    let alice = alice_box
        .cbox
        .session_from_prekey("alice", &bob_box.bundles[0])
        .unwrap();
    let again = alice.encrypt(b"Hello again").unwrap();
    let err = crypto_error(bob.decrypt(&again).unwrap_err());
    assert!(matches!(err, CryptoError::InvalidMessage(_)));

    // Deleting an unknown session is fine.
    alice_box.cbox.delete_session("never-existed").unwrap();
}

#[test]
fn invalid_session_ids_are_rejected() {
    let alice_box = fixture();
    for sid in ["", ".hidden", "../escape", "with space"] {
        let err = crypto_error(alice_box.cbox.try_get_session(sid).unwrap_err());
        assert!(matches!(err, CryptoError::InvalidString(_)), "{sid:?}");
        assert_eq!(err.code(), 10);
    }
    let long = "x".repeat(256);
    assert!(alice_box.cbox.session_from_prekey(&long, &alice_box.bundles[0]).is_err());
}

#[test]
fn sessions_are_usable_across_threads() {
    let alice_box = fixture();
    let bob_box = fixture();

    let alice = alice_box
        .cbox
        .session_from_prekey("bob", &bob_box.bundles[0])
        .unwrap();
    let (bob, _) = bob_box
        .cbox
        .session_from_message("alice", &alice.encrypt(b"hi").unwrap())
        .unwrap();

    let workers: Vec<_> = (0..4u8)
        .map(|t| {
            let alice = Arc::clone(&alice);
            thread::spawn(move || {
                (0..10u8)
                    .map(|i| (vec![t, i], alice.encrypt(&[t, i]).unwrap()))
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for worker in workers {
        for (plaintext, cipher) in worker.join().unwrap() {
            assert_eq!(bob.decrypt(&cipher).unwrap(), plaintext);
        }
    }
}

// ── External identity ────────────────────────────────────────────────

#[test]
fn external_identity_modes() {
    let alice_box = fixture();
    let bob_box = fixture();
    let alice_ident = alice_box.cbox.copy_identity().unwrap();
    let Fixture { dir, cbox, .. } = alice_box;
    cbox.close();

    let complete = CryptoBox::open_with(dir.path(), &alice_ident, IdentityMode::Complete).unwrap();
    assert_eq!(*complete.copy_identity().unwrap(), *alice_ident);
    complete.close();

    let public = CryptoBox::open_with(dir.path(), &alice_ident, IdentityMode::Public).unwrap();
    assert_eq!(*public.copy_identity().unwrap(), *alice_ident);
    public.close();

    // Only the public half is on disk now.
    let err = crypto_error(CryptoBox::open(dir.path()).unwrap_err());
    assert!(matches!(err, CryptoError::IdentityError(_)));
    assert_eq!(err.code(), 13);

    let bob_ident = bob_box.cbox.copy_identity().unwrap();
    let err = crypto_error(
        CryptoBox::open_with(dir.path(), &bob_ident, IdentityMode::Complete).unwrap_err(),
    );
    assert!(matches!(err, CryptoError::IdentityError(_)));

    // Restoring the complete identity makes a plain open work again.
    CryptoBox::open_with(dir.path(), &alice_ident, IdentityMode::Complete)
        .unwrap()
        .close();
    let reopened = CryptoBox::open(dir.path()).unwrap();
    assert_eq!(*reopened.copy_identity().unwrap(), *alice_ident);
}

#[test]
fn malformed_identity_bytes_are_an_identity_error() {
    let dir = TempDir::new().unwrap();
    let err = crypto_error(CryptoBox::open_with(dir.path(), b"nope", IdentityMode::Complete).unwrap_err());
    assert!(matches!(err, CryptoError::IdentityError(_)));
}
