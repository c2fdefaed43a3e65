//! Integration tests for callback-scoped transactions on SQLite.
//!
//! These tests verify commit and rollback behavior, that connections always return
//! to the pool, and that a transaction's statements stay on its own connection.

use lanston::db::TransactionState;
use lanston::{ConnectOptions, Database, DbError, Model, Selection};
use serde_json::json;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, oneshot};

/// Create a test database with `users` and `emails` tables.
async fn setup_database(pool_params: &str) -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let url = format!(
        "sqlite:{}?mode=rwc&{}",
        temp_file.path().to_str().unwrap(),
        pool_params
    );

    let db = Database::connect_with(ConnectOptions::parse(&url).unwrap())
        .await
        .expect("Failed to connect to test database");

    db.query(
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            last_name TEXT
        );
        CREATE TABLE emails (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            email TEXT NOT NULL UNIQUE
        );",
        &[],
    )
    .await
    .expect("Failed to create test tables");

    (db, temp_file)
}

async fn count(model: &Model) -> usize {
    model
        .select(&json!({}), Selection::All, None)
        .await
        .unwrap()
        .len()
}

/// Released connections go back to the pool on a background task.
async fn wait_until_idle(db: &Database) -> lanston::db::PoolStatus {
    for _ in 0..100 {
        let status = db.pool_status().await.unwrap();
        if status.leased() == 0 {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    db.pool_status().await.unwrap()
}

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("validation failed: {0}")]
    Validation(String),
}

#[tokio::test]
async fn test_commit_makes_all_statements_visible() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");
    let emails = db.model("emails");

    let (u, e) = (users.clone(), emails.clone());
    let user_id = db
        .transaction(move |tx| {
            Box::pin(async move {
                let user = u
                    .insert(
                        &json!({"first_name": "alois", "last_name": "barreras"}),
                        Some(Selection::from("id")),
                        Some(&mut *tx),
                    )
                    .await?;
                let user_id = user[0].get("id").cloned().unwrap_or_default();
                e.insert(
                    &json!({"user_id": user_id.clone(), "email": "alois@example.com"}),
                    None,
                    Some(tx),
                )
                .await?;
                Ok::<_, DbError>(user_id)
            })
        })
        .await
        .unwrap();

    assert_eq!(user_id, json!(1));
    assert_eq!(count(&users).await, 1);
    assert_eq!(count(&emails).await, 1);
}

#[tokio::test]
async fn test_error_rolls_back_every_statement() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");
    let emails = db.model("emails");

    let (u, e) = (users.clone(), emails.clone());
    let err = db
        .transaction(move |tx| {
            Box::pin(async move {
                u.insert(&json!({"first_name": "alois"}), None, Some(&mut *tx))
                    .await?;
                e.insert(
                    &json!({"user_id": 1, "email": "alois@example.com"}),
                    None,
                    Some(tx),
                )
                .await?;
                Err::<(), _>(AppError::Validation("email domain not allowed".into()))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Validation(_)));
    assert_eq!(count(&users).await, 0);
    assert_eq!(count(&emails).await, 0);
    assert_eq!(wait_until_idle(&db).await.leased(), 0);
}

#[tokio::test]
async fn test_statement_error_rolls_back_and_propagates() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");

    let u = users.clone();
    let err = db
        .transaction(move |tx| {
            Box::pin(async move {
                u.insert(&json!({"first_name": "alois"}), None, Some(&mut *tx))
                    .await?;
                // first_name is NOT NULL
                u.insert(&json!({"last_name": "barreras"}), None, Some(tx))
                    .await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Statement { .. }));
    assert_eq!(count(&users).await, 0);
}

#[tokio::test]
async fn test_explicit_rollback_resolves_with_callback_value() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");

    let u = users.clone();
    let (value, state) = db
        .transaction(move |tx| {
            Box::pin(async move {
                u.insert(&json!({"first_name": "alois"}), None, Some(&mut *tx))
                    .await?;
                tx.rollback().await?;

                // The context is finished; further statements are refused
                let err = u
                    .insert(&json!({"first_name": "sam"}), None, Some(&mut *tx))
                    .await
                    .unwrap_err();
                assert!(matches!(err, DbError::Transaction { .. }));

                Ok::<_, DbError>(("aborted", tx.state()))
            })
        })
        .await
        .unwrap();

    assert_eq!(value, "aborted");
    assert_eq!(state, TransactionState::RolledBack);
    assert_eq!(count(&users).await, 0);
}

#[tokio::test]
async fn test_bound_executor_is_isolated_until_commit() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");

    let (inserted_tx, inserted_rx) = oneshot::channel::<()>();
    let (checked_tx, checked_rx) = oneshot::channel::<()>();

    let worker_db = db.clone();
    let u = users.clone();
    let worker = tokio::spawn(async move {
        worker_db
            .transaction(move |tx| {
                Box::pin(async move {
                    u.insert(&json!({"first_name": "alois"}), None, Some(&mut *tx))
                        .await?;
                    // Visible on the transaction's own connection
                    let own = u.select(&json!({}), Selection::All, Some(tx)).await?;
                    assert_eq!(own.len(), 1);

                    let _ = inserted_tx.send(());
                    let _ = checked_rx.await;
                    Ok::<_, DbError>(())
                })
            })
            .await
    });

    inserted_rx.await.unwrap();
    assert_eq!(count(&users).await, 0);
    checked_tx.send(()).unwrap();

    worker.await.unwrap().unwrap();
    assert_eq!(count(&users).await, 1);
}

#[tokio::test]
async fn test_connections_are_never_leaked() {
    let (db, _temp_file) = setup_database("max_connections=2&acquire_timeout=5").await;

    let (started_tx, mut started_rx) = mpsc::channel::<()>(2);
    let mut releases = Vec::new();
    let mut workers = Vec::new();

    for i in 0..2 {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        releases.push(release_tx);
        let started = started_tx.clone();
        let users = db.model("users");
        let worker_db = db.clone();

        workers.push(tokio::spawn(async move {
            worker_db
                .transaction(move |tx| {
                    Box::pin(async move {
                        users.select(&json!({}), Selection::All, Some(tx)).await?;
                        let _ = started.send(()).await;
                        let _ = release_rx.await;
                        if i == 0 {
                            Ok(())
                        } else {
                            Err(DbError::invalid_input("worker failed"))
                        }
                    })
                })
                .await
        }));
    }

    started_rx.recv().await.unwrap();
    started_rx.recv().await.unwrap();
    assert_eq!(db.pool_status().await.unwrap().leased(), 2);

    // Both connections are leased, so a third transaction has to wait
    let third = tokio::time::timeout(
        Duration::from_millis(200),
        db.transaction(|tx| Box::pin(async move { tx.query("SELECT 1", &[]).await.map(|_| ()) })),
    )
    .await;
    assert!(third.is_err(), "third transaction should still be waiting");

    // A queued transaction proceeds as soon as one of the two is released
    let queued_db = db.clone();
    let queued = tokio::spawn(async move {
        queued_db
            .transaction(|tx| Box::pin(async move { tx.query("SELECT 1", &[]).await.map(|_| ()) }))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!queued.is_finished());

    let mut releases = releases.into_iter();
    releases.next().unwrap().send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), queued)
        .await
        .expect("queued transaction should get the released connection")
        .unwrap()
        .unwrap();

    for release in releases {
        release.send(()).unwrap();
    }
    let results: Vec<_> = futures_util::future::join_all(workers)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert!(results[0].is_ok());
    assert!(results[1].is_err());

    let status = wait_until_idle(&db).await;
    assert_eq!(status.idle, status.size as usize);

    // The pool is usable again
    db.transaction(|tx| Box::pin(async move { tx.query("SELECT 1", &[]).await.map(|_| ()) }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_commit_reports_aborted_and_releases_connection() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    db.query(
        "CREATE TABLE accounts (id INTEGER PRIMARY KEY);
        CREATE TABLE transfers (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL
                REFERENCES accounts (id) DEFERRABLE INITIALLY DEFERRED
        );",
        &[],
    )
    .await
    .unwrap();
    let transfers = db.model("transfers");

    let t = transfers.clone();
    let err = db
        .transaction(move |tx| {
            Box::pin(async move {
                // Checked only at COMMIT
                t.insert(&json!({"account_id": 42}), None, Some(tx)).await?;
                Ok::<_, DbError>(())
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::TransactionAborted { .. }), "{err}");
    assert!(err.to_string().contains("commit failed"));
    assert_eq!(count(&transfers).await, 0);

    let status = wait_until_idle(&db).await;
    assert_eq!(status.leased(), 0);

    // The connection came back without an open transaction
    db.transaction(|tx| {
        Box::pin(async move {
            tx.query("INSERT INTO accounts (id) VALUES (1)", &[]).await?;
            tx.query("INSERT INTO transfers (account_id) VALUES (1)", &[])
                .await
                .map(|_| ())
        })
    })
    .await
    .unwrap();
    assert_eq!(count(&transfers).await, 1);
}

#[tokio::test]
async fn test_nested_transaction_uses_separate_connection() {
    let (db, _temp_file) = setup_database("max_connections=2").await;
    let users = db.model("users");

    let inner_db = db.clone();
    let u = users.clone();
    let err = db
        .transaction(move |outer| {
            Box::pin(async move {
                let outer_id = outer.id().to_string();
                let inner_id = inner_db
                    .transaction(move |inner| {
                        Box::pin(async move {
                            u.insert(&json!({"first_name": "alois"}), None, Some(&mut *inner))
                                .await?;
                            Ok::<_, DbError>(inner.id().to_string())
                        })
                    })
                    .await?;
                assert_ne!(outer_id, inner_id);
                Err::<(), _>(DbError::invalid_input("outer fails"))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::InvalidInput { .. }));
    // The inner transaction committed on its own connection
    assert_eq!(count(&users).await, 1);
}

#[tokio::test]
async fn test_transaction_before_connect_fails() {
    let db = Database::new();
    let err = db
        .transaction(|tx| Box::pin(async move { tx.query("SELECT 1", &[]).await.map(|_| ()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotConnected));
}

#[tokio::test]
async fn test_lease_timeout_when_pool_exhausted() {
    let (db, _temp_file) = setup_database("max_connections=1&acquire_timeout=1").await;

    let (held_tx, held_rx) = oneshot::channel::<()>();
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let worker_db = db.clone();
    let worker = tokio::spawn(async move {
        worker_db
            .transaction(move |_tx| {
                Box::pin(async move {
                    let _ = held_tx.send(());
                    let _ = done_rx.await;
                    Ok::<_, DbError>(())
                })
            })
            .await
    });

    held_rx.await.unwrap();
    let err = db
        .transaction(|tx| Box::pin(async move { tx.query("SELECT 1", &[]).await.map(|_| ()) }))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Timeout { .. }));

    done_tx.send(()).unwrap();
    worker.await.unwrap().unwrap();
}
