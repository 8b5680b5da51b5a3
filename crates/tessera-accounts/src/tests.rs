use tessera_core::Timestamp;
use tessera_core::id::UserId;

use crate::{AccountsDb, AccountsError, AccountsResult, hash_password};

async fn temp_db() -> AccountsResult<AccountsDb> {
    AccountsDb::open_in_memory().await
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn index_round_trip_and_uniqueness() -> AccountsResult<()> {
    let db = temp_db().await?;
    let alice = UserId::generate();

    db.add_user("alice", &alice).await?;
    assert_eq!(db.get_user_id("alice").await?, Some(alice.clone()));
    assert_eq!(db.get_username(&alice).await?, Some("alice".to_owned()));

    // both sides are unique
    let err = db.add_user("alice", &UserId::generate()).await.unwrap_err();
    assert!(matches!(err, AccountsError::UsernameTaken { .. }));
    let err = db.add_user("alice2", &alice).await.unwrap_err();
    assert!(matches!(err, AccountsError::UserIdTaken { .. }));

    let bob = UserId::generate();
    db.add_user("bob", &bob).await?;
    let all = db.all_by_username().await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all["bob"], bob);

    // delete invalidates the cache, so the name is free again
    db.delete_user_by_id(&alice).await?;
    assert_eq!(db.get_user_id("alice").await?, None);
    db.add_user("alice", &UserId::generate()).await?;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn password_history_enforces_no_reuse() -> AccountsResult<()> {
    let db = temp_db().await?;
    let user = UserId::generate();

    for password in ["first-pass", "second-pass", "third-pass"] {
        let hash = hash_password(password)?;
        db.set_password_hash(&user, hash, "access-1", 2).await?;
    }

    assert!(db.verify_password(&user, "third-pass").await?);
    assert!(!db.verify_password(&user, "second-pass").await?);

    // depth 2: the two most recent hashes count as used
    assert!(db.password_used_recently(&user, "third-pass", 2).await?);
    assert!(db.password_used_recently(&user, "second-pass", 2).await?);
    assert!(!db.password_used_recently(&user, "first-pass", 2).await?);

    db.delete_password_history(&user).await?;
    assert!(!db.verify_password(&user, "third-pass").await?);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn sessions_expire_by_inactivity() -> AccountsResult<()> {
    let db = temp_db().await?;
    let token = db.create_session("alice", "test-app").await?;
    let now = Timestamp::now();

    let session = db.get_session(&token, now, 3600.0).await?.expect("live");
    assert_eq!(session.username, "alice");
    assert_eq!(session.app_id, "test-app");

    // inactivity window elapsed
    let much_later = now.add_secs(7200.0);
    assert!(db.get_session(&token, much_later, 3600.0).await?.is_none());

    // touching keeps it alive
    db.touch_session(&token, now.add_secs(3000.0)).await?;
    assert!(
        db.get_session(&token, now.add_secs(6000.0), 3600.0)
            .await?
            .is_some()
    );

    let swept = db.sweep_expired_sessions(now.add_secs(10_000.0), 3600.0).await?;
    assert_eq!(swept, 1);
    assert!(db.get_session(&token, now, 3600.0).await?.is_none());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_sessions_for_user() -> AccountsResult<()> {
    let db = temp_db().await?;
    let t1 = db.create_session("alice", "app-one").await?;
    let _t2 = db.create_session("alice", "app-two").await?;
    let t3 = db.create_session("bob", "app-one").await?;

    assert!(db.delete_session(&t1).await?);
    assert!(!db.delete_session(&t1).await?);

    let removed = db.delete_sessions_for("alice").await?;
    assert_eq!(removed, 1);
    assert!(
        db.get_session(&t3, Timestamp::now(), 3600.0)
            .await?
            .is_some()
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn local_uniqueness_claims() -> AccountsResult<()> {
    let db = temp_db().await?;
    let alice = UserId::generate();
    let bob = UserId::generate();

    assert!(db.claim_unique("email", "a@b.io", &alice).await?.is_ok());
    // reclaiming your own value is fine
    assert!(db.claim_unique("email", "a@b.io", &alice).await?.is_ok());
    // someone else's claim reports the owner
    assert_eq!(
        db.claim_unique("email", "a@b.io", &bob).await?,
        Err(alice.clone())
    );

    db.release_unique("email", "a@b.io").await?;
    assert!(db.claim_unique("email", "a@b.io", &bob).await?.is_ok());

    db.claim_unique("email", "b@b.io", &alice).await?.unwrap();
    db.claim_unique("phone", "123", &alice).await?.unwrap();
    let released = db.release_unique_for(&alice).await?;
    assert_eq!(released, 2);
    Ok(())
}
