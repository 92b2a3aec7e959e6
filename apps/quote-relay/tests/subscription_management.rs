//! Subscription management integration tests.
//!
//! Exercises the full path from session open/close through the registry
//! to the upstream link commands, with a mocked snapshot fetcher.

use std::sync::Arc;
use std::time::Duration;

use quote_relay::{
    BaselineTracker, LinkCommand, LinkStatus, QuoteSnapshot, RelayService, SessionSettings,
    SnapshotError, SnapshotFetcher, SubscriptionRegistry, SymbolSeed, TradeBus,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mockall::mock! {
    Fetcher {}

    #[async_trait::async_trait]
    impl SnapshotFetcher for Fetcher {
        async fn fetch_quote(&self, symbol: &str) -> Result<QuoteSnapshot, SnapshotError>;
    }
}

struct Harness {
    service: Arc<RelayService>,
    registry: Arc<SubscriptionRegistry>,
    link: mpsc::UnboundedReceiver<LinkCommand>,
}

fn setup(fetcher: MockFetcher) -> Harness {
    let registry = Arc::new(SubscriptionRegistry::new());
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let service = Arc::new(RelayService::new(
        Arc::clone(&registry),
        Arc::new(TradeBus::default()),
        Arc::new(BaselineTracker::new()),
        link_tx,
        Arc::new(LinkStatus::new()),
        Arc::new(fetcher),
        SessionSettings::default(),
    ));
    Harness {
        service,
        registry,
        link: link_rx,
    }
}

fn unavailable_fetcher() -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch_quote()
        .returning(|symbol| Err(SnapshotError::Unavailable(symbol.to_string())));
    fetcher
}

async fn recv_command(link: &mut mpsc::UnboundedReceiver<LinkCommand>) -> LinkCommand {
    tokio::time::timeout(Duration::from_secs(5), link.recv())
        .await
        .expect("timed out waiting for link command")
        .expect("link channel closed")
}

#[tokio::test]
async fn first_subscriber_reaches_upstream_once() {
    let mut harness = setup(unavailable_fetcher());

    let _session = harness
        .service
        .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
        .unwrap();

    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Subscribe("AAPL".to_string())
    );
    assert_eq!(harness.registry.active_symbols(), vec!["AAPL".to_string()]);
}

#[tokio::test]
async fn many_sessions_one_upstream_subscription() {
    let mut harness = setup(unavailable_fetcher());

    let sessions: Vec<_> = (0..5)
        .map(|_| {
            harness
                .service
                .open_session(vec![SymbolSeed::bare("TSLA")], CancellationToken::new())
                .unwrap()
        })
        .collect();

    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Subscribe("TSLA".to_string())
    );
    assert!(harness.link.try_recv().is_err(), "exactly one subscribe expected");
    assert_eq!(harness.registry.stats().session_count, 5);

    // Dropping all but one keeps the upstream subscription alive.
    let mut sessions = sessions.into_iter();
    let _survivor = sessions.next();
    for session in sessions {
        drop(session);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.link.try_recv().is_err(), "no unsubscribe while interest remains");
    assert_eq!(harness.registry.active_symbols(), vec!["TSLA".to_string()]);
}

#[tokio::test]
async fn last_session_releases_upstream_subscription() {
    let mut harness = setup(unavailable_fetcher());

    let first = harness
        .service
        .open_session(vec![SymbolSeed::bare("MSFT")], CancellationToken::new())
        .unwrap();
    let second = harness
        .service
        .open_session(vec![SymbolSeed::bare("MSFT")], CancellationToken::new())
        .unwrap();

    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Subscribe("MSFT".to_string())
    );

    drop(first);
    drop(second);

    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Unsubscribe("MSFT".to_string())
    );
    assert!(harness.registry.active_symbols().is_empty());
}

#[tokio::test]
async fn disjoint_sessions_do_not_interfere() {
    let mut harness = setup(unavailable_fetcher());

    let apple = harness
        .service
        .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
        .unwrap();
    let micro = harness
        .service
        .open_session(vec![SymbolSeed::bare("MSFT")], CancellationToken::new())
        .unwrap();

    let mut subscribed = vec![
        recv_command(&mut harness.link).await,
        recv_command(&mut harness.link).await,
    ];
    subscribed.sort_by_key(|c| format!("{c:?}"));
    assert_eq!(
        subscribed,
        vec![
            LinkCommand::Subscribe("AAPL".to_string()),
            LinkCommand::Subscribe("MSFT".to_string()),
        ]
    );

    drop(apple);
    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Unsubscribe("AAPL".to_string())
    );
    assert_eq!(harness.registry.active_symbols(), vec!["MSFT".to_string()]);
    drop(micro);
}

#[tokio::test]
async fn duplicate_symbols_in_request_collapse() {
    let mut harness = setup(unavailable_fetcher());

    let _session = harness
        .service
        .open_session(
            vec![
                SymbolSeed::bare("nvda"),
                SymbolSeed::bare("NVDA"),
                SymbolSeed::bare(" nvda "),
            ],
            CancellationToken::new(),
        )
        .unwrap();

    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Subscribe("NVDA".to_string())
    );
    assert!(harness.link.try_recv().is_err());
    assert_eq!(harness.registry.active_symbols(), vec!["NVDA".to_string()]);
}

#[tokio::test]
async fn session_count_tracks_lifecycle() {
    let mut harness = setup(unavailable_fetcher());
    assert_eq!(harness.service.session_count(), 0);

    let session = harness
        .service
        .open_session(vec![SymbolSeed::bare("AAPL")], CancellationToken::new())
        .unwrap();
    assert_eq!(harness.service.session_count(), 1);

    drop(session);
    // Teardown is asynchronous; wait for the unsubscribe to confirm it ran.
    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Subscribe("AAPL".to_string())
    );
    assert_eq!(
        recv_command(&mut harness.link).await,
        LinkCommand::Unsubscribe("AAPL".to_string())
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.service.session_count(), 0);
}
