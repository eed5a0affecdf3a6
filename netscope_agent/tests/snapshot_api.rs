//! Snapshot API over loopback.
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use netscope_agent::types::{LinkIdentity, Snapshot};
use netscope_agent::{api, Mutation, SnapshotStore};

async fn start(token: Option<&str>) -> (String, CancellationToken, tokio::task::JoinHandle<std::io::Result<()>>) {
    let store = SnapshotStore::shared(8);
    store.apply(Mutation::Link(LinkIdentity {
        name: "LabNet".into(),
        ..LinkIdentity::default()
    }));
    store.apply(Mutation::RateTick {
        download_bps: 4e6,
        upload_bps: 1e6,
        elapsed_seconds: 1.0,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let cancel = CancellationToken::new();
    let task = tokio::spawn(api::serve(listener, store, token.map(String::from), cancel.clone()));
    (base, cancel, task)
}

async fn get(url: String) -> reqwest::Response {
    // loopback only; ignore any proxy settings in the environment
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    client.get(url).send().await.unwrap()
}

#[tokio::test]
async fn serves_current_snapshot_as_json() {
    let (base, cancel, task) = start(None).await;
    let snap: Snapshot = get(format!("{base}/snapshot"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(snap.link.name, "LabNet");
    assert_eq!(snap.download_bps, 4e6);
    assert_eq!(snap.history.len(), 1);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn token_is_enforced() {
    let (base, cancel, task) = start(Some("s3cret")).await;
    let denied = get(format!("{base}/snapshot")).await;
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
    let wrong = get(format!("{base}/snapshot?token=nope")).await;
    assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);
    let ok = get(format!("{base}/snapshot?token=s3cret")).await;
    assert!(ok.status().is_success());
    drop((denied, wrong, ok));

    cancel.cancel();
    task.await.unwrap().unwrap();
}
