mod support;

use std::time::Duration;

use mkv_client::{ClientConfig, ConnConfig, Error, SingleClient};
use support::{bulk, MockServer};

async fn client(server: &MockServer, cache_size: usize) -> anyhow::Result<SingleClient> {
    let client = SingleClient::with_config(ClientConfig {
        addr: server.addr.clone(),
        conn: ConnConfig {
            cache_size,
            connect_timeout: Some(Duration::from_secs(1)),
            ..ConnConfig::default()
        },
    })
    .await?;
    Ok(client)
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn second_read_is_served_locally() -> anyhow::Result<()> {
    support::init_tracing();
    let server = MockServer::start().await?;
    server.set("user:1", "alice");
    let client = client(&server, 1 << 20).await?;

    for _ in 0..2 {
        let get = client.builder().cmd("GET").key("user:1").cacheable().build();
        let value = client.execute_cached(get, Duration::from_secs(60)).await?;
        assert_eq!(value, bulk("alice"));
    }

    assert_eq!(server.count("GET"), 1);
    assert_eq!(server.count("PTTL"), 1);
    let stats = client.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    Ok(())
}

#[tokio::test]
async fn fetch_runs_as_a_tracked_transaction() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k", "v");
    let client = client(&server, 1 << 20).await?;

    let get = client.builder().cmd("GET").key("k").cacheable().build();
    client.execute_cached(get, Duration::from_secs(60)).await?;

    let names: Vec<String> = server
        .commands()
        .into_iter()
        .skip_while(|args| args[0] != "CLIENT" || args[1] != "CACHING")
        .map(|args| args.join(" "))
        .collect();
    assert_eq!(names, vec!["CLIENT CACHING YES", "MULTI", "PTTL k", "GET k", "EXEC"]);
    Ok(())
}

#[tokio::test]
async fn invalidation_forces_a_refetch() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k", "old");
    let client = client(&server, 1 << 20).await?;

    let get = || client.builder().cmd("GET").key("k").cacheable().build();
    assert_eq!(client.execute_cached(get(), Duration::from_secs(60)).await?, bulk("old"));

    server.write("k", "new");
    wait_for(|| client.stats().invalidations > 0).await;
    assert_eq!(client.stats().invalidations, 1);

    assert_eq!(client.execute_cached(get(), Duration::from_secs(60)).await?, bulk("new"));
    assert_eq!(server.count("GET"), 2);
    Ok(())
}

#[tokio::test]
async fn invalidating_any_key_evicts_a_multi_key_read() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k1", "a");
    server.set("k2", "b");
    let client = client(&server, 1 << 20).await?;

    let mget = || client.builder().cmd("MGET").key("k1").key("k2").cacheable().build();
    client.execute_cached(mget(), Duration::from_secs(60)).await?;
    client.execute_cached(mget(), Duration::from_secs(60)).await?;
    assert_eq!(server.count("MGET"), 1);

    server.write("k2", "c");
    wait_for(|| client.stats().invalidations > 0).await;
    assert_eq!(client.stats().invalidations, 1);

    let reply = client.execute_cached(mget(), Duration::from_secs(60)).await?;
    assert_eq!(reply, mkv_client::RespValue::Array(vec![bulk("a"), bulk("c")]));
    assert_eq!(server.count("MGET"), 2);
    Ok(())
}

#[tokio::test]
async fn own_write_invalidates_through_the_server() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k", "1");
    let client = client(&server, 1 << 20).await?;

    let get = || client.builder().cmd("GET").key("k").cacheable().build();
    client.execute_cached(get(), Duration::from_secs(60)).await?;
    client.execute(client.builder().cmd("SET").key("k").arg("2").build()).await?;

    // The push precedes the SET reply on the same socket.
    assert_eq!(client.execute_cached(get(), Duration::from_secs(60)).await?, bulk("2"));
    Ok(())
}

#[tokio::test]
async fn null_invalidation_flushes_everything() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("a", "1");
    server.set("b", "2");
    let client = client(&server, 1 << 20).await?;

    for key in ["a", "b"] {
        let get = client.builder().cmd("GET").key(key).cacheable().build();
        client.execute_cached(get, Duration::from_secs(60)).await?;
    }
    server.flush_tracking();
    wait_for(|| client.stats().invalidations >= 2).await;

    for key in ["a", "b"] {
        let get = client.builder().cmd("GET").key(key).cacheable().build();
        client.execute_cached(get, Duration::from_secs(60)).await?;
    }
    assert_eq!(server.count("GET"), 4);
    Ok(())
}

#[tokio::test]
async fn server_ttl_shortens_the_lifetime() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("session", "token");
    server.set_pttl("session", 50);
    let client = client(&server, 1 << 20).await?;

    let get = || client.builder().cmd("GET").key("session").cacheable().build();
    client.execute_cached(get(), Duration::from_secs(60)).await?;
    tokio::time::sleep(Duration::from_millis(120)).await;
    client.execute_cached(get(), Duration::from_secs(60)).await?;

    assert_eq!(server.count("GET"), 2);
    Ok(())
}

#[tokio::test]
async fn client_ttl_caps_the_lifetime() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k", "v");
    let client = client(&server, 1 << 20).await?;

    let get = || client.builder().cmd("GET").key("k").cacheable().build();
    client.execute_cached(get(), Duration::from_millis(30)).await?;
    client.execute_cached(get(), Duration::from_millis(30)).await?;
    assert_eq!(server.count("GET"), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    client.execute_cached(get(), Duration::from_millis(30)).await?;
    assert_eq!(server.count("GET"), 2);
    Ok(())
}

#[tokio::test]
async fn error_replies_are_not_cached() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    let client = client(&server, 1 << 20).await?;

    for _ in 0..2 {
        let hget = client.builder().cmd("HGET").key("h").arg("f").cacheable().build();
        let reply = client.execute_cached(hget, Duration::from_secs(60)).await?;
        assert!(reply.is_error());
    }
    assert_eq!(server.count("HGET"), 2);
    assert_eq!(client.stats().cache_hits, 0);
    Ok(())
}

#[tokio::test]
async fn commands_must_opt_in() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    let client = client(&server, 1 << 20).await?;

    let plain = client.builder().cmd("GET").key("k").build();
    let err = client.execute_cached(plain, Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, Error::NotCacheable));
    assert_eq!(server.count("GET"), 0);
    Ok(())
}

#[tokio::test]
async fn disabled_cache_goes_straight_to_the_server() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("k", "v");
    let client = client(&server, 0).await?;

    for _ in 0..3 {
        let get = client.builder().cmd("GET").key("k").cacheable().build();
        assert_eq!(client.execute_cached(get, Duration::from_secs(60)).await?, bulk("v"));
    }
    assert_eq!(server.count("GET"), 3);
    assert_eq!(server.count("MULTI"), 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_misses_share_one_fetch() -> anyhow::Result<()> {
    let server = MockServer::start().await?;
    server.set("hot", "x");
    let client = client(&server, 1 << 20).await?;

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let get = client.builder().cmd("GET").key("hot").cacheable().build();
            client.execute_cached(get, Duration::from_secs(60)).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await??, bulk("x"));
    }
    assert_eq!(server.count("GET"), 1);
    Ok(())
}
