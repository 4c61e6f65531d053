use std::time::Duration;

use pbkv::{dead_interval, ViewClient, ViewServer, PING_INTERVAL};

async fn start_viewservice(addr: &str) -> ViewServer {
    let server = ViewServer::new(addr.parse().unwrap());
    let handle = server.clone();
    tokio::spawn(async move { handle.run().await.unwrap() });
    // Let the listener come up.
    tokio::time::sleep(Duration::from_millis(300)).await;
    server
}

#[tokio::test]
async fn ping_elects_primary_then_backup() {
    let vs = start_viewservice("127.0.0.1:4100").await;

    let mut a = ViewClient::new("127.0.0.1:4101", "127.0.0.1:4100").unwrap();
    let mut b = ViewClient::new("127.0.0.1:4102", "127.0.0.1:4100").unwrap();

    let view = a.ping(0).await.unwrap();
    assert_eq!(view.view_num, 1);
    assert_eq!(view.primary, "127.0.0.1:4101");
    assert!(!view.has_backup());

    // A acknowledges view 1, then B joins as backup.
    a.ping(1).await.unwrap();
    b.ping(0).await.unwrap();
    let view = a.ping(1).await.unwrap();
    assert_eq!(view.view_num, 2);
    assert_eq!(view.primary, "127.0.0.1:4101");
    assert_eq!(view.backup, "127.0.0.1:4102");

    // Get is a pure read and agrees with Ping.
    assert_eq!(b.get().await.unwrap(), view);
    vs.kill();
}

#[tokio::test]
async fn view_waits_for_primary_acknowledgement() {
    let vs = start_viewservice("127.0.0.1:4110").await;

    let mut a = ViewClient::new("127.0.0.1:4111", "127.0.0.1:4110").unwrap();
    let mut b = ViewClient::new("127.0.0.1:4112", "127.0.0.1:4110").unwrap();

    a.ping(0).await.unwrap();

    // A has never acknowledged view 1, so B's arrival cannot be installed.
    for _ in 0..3 {
        let view = b.ping(0).await.unwrap();
        assert_eq!(view.view_num, 1);
        assert!(!view.has_backup());
    }

    let view = a.ping(1).await.unwrap();
    assert_eq!(view.view_num, 2);
    assert_eq!(view.backup, "127.0.0.1:4112");
    vs.kill();
}

#[tokio::test]
async fn silent_primary_is_replaced() {
    let vs = start_viewservice("127.0.0.1:4120").await;

    let mut a = ViewClient::new("127.0.0.1:4121", "127.0.0.1:4120").unwrap();
    let mut b = ViewClient::new("127.0.0.1:4122", "127.0.0.1:4120").unwrap();

    a.ping(0).await.unwrap();
    a.ping(1).await.unwrap();
    b.ping(0).await.unwrap();
    let view = a.ping(2).await.unwrap();
    assert_eq!(view.view_num, 2);

    // A goes silent; B keeps pinging past the dead interval.
    let deadline = tokio::time::Instant::now() + dead_interval() * 3;
    let mut view = view;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(PING_INTERVAL / 2).await;
        let latest = b.ping(view.view_num).await.unwrap();
        // View numbers observed by one caller never go backwards.
        assert!(latest.view_num >= view.view_num);
        view = latest;
        if view.primary == "127.0.0.1:4122" {
            break;
        }
    }

    assert_eq!(view.view_num, 3);
    assert_eq!(view.primary, "127.0.0.1:4122");
    assert!(!view.has_backup());
    vs.kill();
}

#[tokio::test]
async fn restarted_primary_steps_down() {
    let vs = start_viewservice("127.0.0.1:4130").await;

    let mut a = ViewClient::new("127.0.0.1:4131", "127.0.0.1:4130").unwrap();
    let mut b = ViewClient::new("127.0.0.1:4132", "127.0.0.1:4130").unwrap();

    a.ping(0).await.unwrap();
    a.ping(1).await.unwrap();
    b.ping(0).await.unwrap();
    let view = a.ping(2).await.unwrap();
    assert_eq!(view.view_num, 2);

    // A pings as freshly started: it lost its state and must step down.
    let view = a.ping(0).await.unwrap();
    assert_eq!(view.view_num, 3);
    assert_eq!(view.primary, "127.0.0.1:4132");
    assert!(!view.has_backup());
    vs.kill();
}
