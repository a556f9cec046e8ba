mod support;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use relink::connection::frame::Frame;
use relink::{Client, ClientEvent, ClientState, Config, RelinkConnectionError};

use support::{next_session, wait_for, MockConnector};

fn record_events(client: &Client) -> Arc<Mutex<Vec<ClientEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.on(Arc::new(move |event| {
        sink.lock().unwrap().push(event.clone());
    }));
    events
}

#[tokio::test(start_paused = true)]
async fn selects_the_database_before_serving_commands() {
    let mut config = Config::new("mock", 6379);
    config.db = 4;
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(config, connector);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut session = next_session(&mut sessions).await;
    session.connected();

    assert_eq!(session.next_command().await, "select 4");
    session.reply_ok();
    waiter.await.unwrap().unwrap();

    let ping = tokio::spawn({
        let client = client.clone();
        async move { client.ping(None).await }
    });
    assert_eq!(session.next_command().await, "ping");
    session.reply_simple("PONG");
    assert_eq!(ping.await.unwrap().unwrap(), Bytes::from_static(b"PONG"));
}

#[tokio::test(start_paused = true)]
async fn authenticates_before_selecting() {
    let mut config = Config::new("mock", 6379);
    config.password = Some("sekrit".to_string());
    config.db = 2;
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(config, connector);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut session = next_session(&mut sessions).await;
    session.connected();

    assert_eq!(session.next_command().await, "auth sekrit");
    session.reply_ok();
    assert_eq!(session.next_command().await, "select 2");
    session.reply_ok();
    waiter.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn commands_issued_before_connecting_drain_in_order() {
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(Config::new("mock", 6379), connector);

    let first = client.issue("get", &[Bytes::from_static(b"a")]);
    let second = client.issue("get", &[Bytes::from_static(b"b")]);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut session = next_session(&mut sessions).await;
    session.connected();
    waiter.await.unwrap().unwrap();

    assert_eq!(session.next_command().await, "get a");
    assert_eq!(session.next_command().await, "get b");
    session.reply_bulk("1");
    session.reply_bulk("2");
    assert_eq!(first.await.unwrap(), Frame::Bulk(Bytes::from_static(b"1")));
    assert_eq!(second.await.unwrap(), Frame::Bulk(Bytes::from_static(b"2")));
}

#[tokio::test(start_paused = true)]
async fn rejected_setup_retries_like_a_connect_failure() {
    let mut config = Config::new("mock", 6379);
    config.db = 1;
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(config, connector);
    let events = record_events(&client);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });

    let mut first = next_session(&mut sessions).await;
    first.connected();
    assert_eq!(first.next_command().await, "select 1");
    first.reply_error("ERR DB index is out of range");

    let mut second = next_session(&mut sessions).await;
    second.connected();
    assert_eq!(second.next_command().await, "select 1");
    second.reply_ok();
    waiter.await.unwrap().unwrap();

    assert!(events
        .lock()
        .unwrap()
        .contains(&ClientEvent::ReconnectFailed(1)));
    assert_eq!(client.state(), ClientState::Connected);
}

#[tokio::test(start_paused = true)]
async fn in_flight_commands_fail_when_the_session_drops() {
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(Config::new("mock", 6379), connector);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut first = next_session(&mut sessions).await;
    first.connected();
    waiter.await.unwrap().unwrap();

    let get_a = client.issue("get", &[Bytes::from_static(b"a")]);
    let get_b = client.issue("get", &[Bytes::from_static(b"b")]);
    assert_eq!(first.next_command().await, "get a");
    assert_eq!(first.next_command().await, "get b");

    first.kill();
    assert!(matches!(
        get_a.await,
        Err(RelinkConnectionError::ConnectionLost)
    ));
    assert!(matches!(
        get_b.await,
        Err(RelinkConnectionError::ConnectionLost)
    ));

    // The replacement session serves new commands as usual.
    let mut second = next_session(&mut sessions).await;
    second.connected();
    wait_for("client reconnected", || {
        client.state() == ClientState::Connected
    })
    .await;

    let get_c = client.issue("get", &[Bytes::from_static(b"c")]);
    assert_eq!(second.next_command().await, "get c");
    second.reply_bulk("3");
    assert_eq!(get_c.await.unwrap(), Frame::Bulk(Bytes::from_static(b"3")));
}

#[tokio::test(start_paused = true)]
async fn failed_state_rejects_queued_and_new_commands() {
    let (connector, _sessions) = MockConnector::with_failures(5);
    let client = Client::with_connector(Config::new("mock", 6379), connector);

    let queued = client.issue("get", &[Bytes::from_static(b"a")]);
    assert!(client.connect().await.is_err());

    assert!(matches!(
        queued.await,
        Err(RelinkConnectionError::ClientFailed)
    ));
    assert!(matches!(
        client.issue("get", &[Bytes::from_static(b"b")]).await,
        Err(RelinkConnectionError::ClientFailed)
    ));
}

#[tokio::test(start_paused = true)]
async fn select_carries_over_to_the_next_connection() {
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(Config::new("mock", 6379), connector);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut first = next_session(&mut sessions).await;
    first.connected();
    waiter.await.unwrap().unwrap();

    let select = tokio::spawn({
        let client = client.clone();
        async move { client.select(4).await }
    });
    assert_eq!(first.next_command().await, "select 4");
    first.reply_ok();
    select.await.unwrap().unwrap();

    first.kill();
    let mut second = next_session(&mut sessions).await;
    second.connected();

    // Setup on the replacement connection replays the selected database.
    assert_eq!(second.next_command().await, "select 4");
    second.reply_ok();
    wait_for("client reconnected", || {
        client.state() == ClientState::Connected
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn error_replies_fail_one_command_without_closing() {
    let (connector, mut sessions) = MockConnector::new();
    let client = Client::with_connector(Config::new("mock", 6379), connector);

    let waiter = tokio::spawn({
        let client = client.clone();
        async move { client.connect().await }
    });
    let mut session = next_session(&mut sessions).await;
    session.connected();
    waiter.await.unwrap().unwrap();

    let bad = client.issue("incr", &[Bytes::from_static(b"k")]);
    assert_eq!(session.next_command().await, "incr k");
    session.reply_error("WRONGTYPE Operation against a key holding the wrong kind of value");
    assert!(matches!(bad.await, Err(RelinkConnectionError::Command(_))));

    // Still connected, later commands are unaffected.
    let del = tokio::spawn({
        let client = client.clone();
        async move { client.del("k").await }
    });
    assert_eq!(session.next_command().await, "del k");
    session.reply_integer(1);
    assert_eq!(del.await.unwrap().unwrap(), 1);
}
