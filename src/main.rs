use anyhow::Error;
use social_state::{
    Config, FriendsError, MemoryIdentityService, NameResolver, Session, AUTHORS_CHANGED,
    FRIENDS_CHANGED,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

mod signal;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Set the RUST_LOG, if it hasn't been explicitly defined
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "social_state=debug")
    }
    tracing_subscriber::fmt::init();

    const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

    tracing::info!("program starts");

    let fixture = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "data/fixture.json".to_string());
    let service = Arc::new(MemoryIdentityService::load(&fixture)?);
    let config = Config::from_env()?;
    let session = Session::new(&config, service);
    session.init().await?;

    let mut halt = false;
    let (halt_tx, halt_rx) = watch::channel(halt);

    let mut join_handles = vec![];
    {
        let session = session.clone();
        let authors_rx = session.bus.subscribe(AUTHORS_CHANGED);
        let friends_rx = session.bus.subscribe(FRIENDS_CHANGED);
        let halt_rx = halt_rx.clone();
        join_handles.push(tokio::spawn(async move {
            observer(session, authors_rx, friends_rx, halt_rx).await
        }));
    }
    {
        let session = session.clone();
        let halt_rx = halt_rx.clone();
        join_handles.push(tokio::spawn(async move {
            refresher(session, REFRESH_INTERVAL, halt_rx).await
        }));
    }

    tracing::info!("waiting for shutdown signal");
    signal::shutdown_signal().await;

    halt = true;
    halt_tx.send(halt)?;

    for join_handle in join_handles {
        let result = join_handle.await?;
        tracing::debug!("join result = {:?}", result);
    }
    session.shutdown().await;

    tracing::info!("program terminates normally");
    Ok(())
}

/// log the views whenever the bus says they changed
async fn observer(
    session: Session,
    mut authors_rx: broadcast::Receiver<serde_json::Value>,
    mut friends_rx: broadcast::Receiver<serde_json::Value>,
    mut halt_rx: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut halt = *halt_rx.borrow();

    while !halt {
        tokio::select! {
            _ = halt_rx.changed() => {halt = *halt_rx.borrow()}
            recv_result = authors_rx.recv() => {
                let resolved = recv_result?;
                tracing::info!("authors changed: {}; known authors = {:?}", resolved, session.authors.get_plain());
            }
            recv_result = friends_rx.recv() => {
                recv_result?;
                let friends = session.friends.get_friends_plain();
                let following: Vec<String> = friends.following.iter().map(|id| session.authors.get_name(id)).collect();
                let blocking: Vec<String> = friends.blocking.iter().map(|id| session.authors.get_name(id)).collect();
                tracing::info!("friends changed: following = {:?}; blocking = {:?}", following, blocking);
            }
        }
    }

    tracing::debug!("observer terminates");
    Ok(())
}

/// refetch the friend set now and then every `interval`
async fn refresher(
    session: Session,
    interval: Duration,
    mut halt_rx: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut halt = *halt_rx.borrow();
    let mut ticker = tokio::time::interval(interval);

    while !halt {
        tokio::select! {
            _ = ticker.tick() => {
                match session.friends.update_friends().await {
                    Ok(friends) => tracing::debug!("refreshed {} relations", friends.identities().len()),
                    Err(FriendsError::Fetch(err)) => tracing::warn!("friend refresh failed: {}", err),
                    Err(err) => return Err(err.into()),
                }
            }
            _ = halt_rx.changed() => {halt = *halt_rx.borrow()}
        }
    }

    tracing::debug!("refresher terminates");
    Ok(())
}
