mod common;

use common::*;
use std::sync::{Arc, Mutex};
use subfeed::{
    AggregatorError, CancelToken, ClientRegistry, ContentCache, ExecuteOptions, FeedAggregator,
    MemorySubscriptionStore, PlannerConfig, SourceChannel, SubscriptionStore,
};

fn targets(channels: Vec<SourceChannel>) -> Vec<(SourceChannel, Vec<String>)> {
    channels
        .into_iter()
        .map(|c| {
            let url = c.url.clone();
            (c, vec![url])
        })
        .collect()
}

fn aggregator_for(clients: Vec<Arc<MockClient>>) -> (FeedAggregator, Arc<MemorySubscriptionStore>) {
    let dyn_clients: Vec<Arc<dyn subfeed::SourceClient>> = clients
        .into_iter()
        .map(|c| c as Arc<dyn subfeed::SourceClient>)
        .collect();
    let store = MemorySubscriptionStore::shared();
    let aggregator = FeedAggregator::new(
        Arc::new(ClientRegistry::new(dyn_clients)),
        store.clone(),
        ContentCache::new(),
        PlannerConfig::default(),
    );
    (aggregator, store)
}

#[tokio::test]
async fn live_fetches_merge_into_one_ordered_feed() {
    init_tracing();
    let client = Arc::new(
        MockClient::new("mock", "mock://")
            .with_items(
                "mock://a",
                vec![
                    item("https://a.example/1", "mock://a", "mock", hours_ago(1)),
                    item("https://a.example/2", "mock://a", "mock", hours_ago(6)),
                ],
            )
            .with_items(
                "mock://b",
                vec![
                    item("https://b.example/1", "mock://b", "mock", hours_ago(3)),
                    item("https://b.example/2", "mock://b", "mock", hours_ago(4)),
                ],
            ),
    );
    let (aggregator, store) = aggregator_for(vec![client]);

    let channels = targets(vec![
        video_channel("mock://a", None),
        video_channel("mock://b", None),
    ]);
    let (mut feed, errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();

    assert!(errors.is_empty());
    let all = collect_all(&mut feed).await.unwrap();
    assert_eq!(all.len(), 4);
    for pair in all.windows(2) {
        assert!(pair[0].timestamp >= pair[1].timestamp);
    }

    // Successful live fetches record the channel's freshness fields.
    let refreshed = store.get("mock://a").await.unwrap();
    assert!(refreshed
        .last_update
        .contains_key(&subfeed::ContentType::Video));

    // Consumed pages land in the cache once background jobs settle.
    aggregator.jobs().drain().await;
    assert_eq!(aggregator.cache().len().await, 4);
}

#[tokio::test]
async fn injected_job_queue_carries_the_background_writes() {
    init_tracing();
    let client = Arc::new(MockClient::new("mock", "mock://").with_items(
        "mock://a",
        vec![item("https://a.example/1", "mock://a", "mock", hours_ago(1))],
    ));
    let jobs = subfeed::JobQueue::new(8);
    let cache = ContentCache::new();
    let aggregator = FeedAggregator::with_job_queue(
        Arc::new(ClientRegistry::new(vec![
            client as Arc<dyn subfeed::SourceClient>
        ])),
        MemorySubscriptionStore::shared(),
        cache.clone(),
        PlannerConfig::default(),
        jobs.clone(),
    );

    let channels = targets(vec![video_channel("mock://a", None)]);
    let (mut feed, errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();
    assert!(errors.is_empty());
    assert_eq!(collect_all(&mut feed).await.unwrap().len(), 1);

    // The cache writes ran on the caller's queue handle, not a private one.
    jobs.drain().await;
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn failed_channel_falls_back_to_cache_contents() {
    init_tracing();
    let client = Arc::new(
        MockClient::new("mock", "mock://").failing("mock://broken", FailureMode::Fetch),
    );
    let (aggregator, _store) = aggregator_for(vec![client]);

    let cached = vec![
        item("https://c.example/1", "mock://broken", "mock", hours_ago(2)),
        item("https://c.example/2", "mock://broken", "mock", hours_ago(7)),
    ];
    for it in cached.clone() {
        aggregator.cache().insert(it).await;
    }

    let channels = targets(vec![video_channel("mock://broken", Some(days_ago(2)))]);
    let (mut feed, errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();

    // The channel's contribution is exactly the cache contents.
    let all = collect_all(&mut feed).await.unwrap();
    let urls: Vec<&str> = all.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(urls, vec!["https://c.example/1", "https://c.example/2"]);

    // And the triggering failure is reported, not thrown.
    assert_eq!(errors.len(), 1);
    assert!(matches!(&errors[0], AggregatorError::Fetch { url, .. } if url == "mock://broken"));
}

#[tokio::test]
async fn cache_fallback_covers_aliased_channel_urls() {
    init_tracing();
    // The channel is fetched through an alias URL, but its cached items are
    // indexed under the channel's own URL. The fallback must find them.
    let client = Arc::new(
        MockClient::new("mock", "mock://").failing("mock://chan/alias", FailureMode::Fetch),
    );
    let (aggregator, _store) = aggregator_for(vec![client]);

    aggregator
        .cache()
        .insert(item("https://c.example/1", "mock://chan", "mock", hours_ago(3)))
        .await;

    let channel = video_channel("mock://chan", Some(days_ago(2)));
    let channels = vec![(channel, vec!["mock://chan/alias".to_string()])];
    let (mut feed, errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();

    let all = collect_all(&mut feed).await.unwrap();
    let urls: Vec<&str> = all.iter().map(|i| i.url.as_str()).collect();
    assert_eq!(urls, vec!["https://c.example/1"]);
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn failure_without_fallback_aborts_the_run() {
    init_tracing();
    let client = Arc::new(
        MockClient::new("mock", "mock://").failing("mock://broken", FailureMode::Fetch),
    );
    let (aggregator, _store) = aggregator_for(vec![client]);

    let channels = targets(vec![video_channel("mock://broken", None)]);
    let options = ExecuteOptions {
        allow_failure: false,
        with_cache_fallback: false,
        ..ExecuteOptions::default()
    };
    assert!(aggregator.plan_and_execute(&channels, &options).await.is_err());
}

#[tokio::test]
async fn fatally_failed_source_skips_remaining_tasks() {
    init_tracing();
    let client = Arc::new(
        MockClient::new("mock", "mock://")
            .failing("mock://first", FailureMode::Reauthorization)
            .failing("mock://second", FailureMode::Reauthorization),
    );
    let (aggregator, _store) = aggregator_for(vec![client.clone()]);

    // Sequential execution so the first task disables the client before the
    // second one is dispatched.
    let options = ExecuteOptions {
        worker_limit: Some(1),
        ..ExecuteOptions::best_effort()
    };
    let channels = targets(vec![
        video_channel("mock://first", Some(days_ago(9))),
        video_channel("mock://second", Some(days_ago(1))),
    ]);
    let (mut feed, errors) = aggregator.plan_and_execute(&channels, &options).await.unwrap();

    // Only the first task reached the network; the second skipped outright
    // and reported no duplicate failure.
    assert_eq!(client.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        &errors[0],
        AggregatorError::ReauthorizationRequired { client_id } if client_id == "mock"
    ));
    assert!(collect_all(&mut feed).await.unwrap().is_empty());
}

#[tokio::test]
async fn progress_is_reported_after_every_task() {
    init_tracing();
    let client = Arc::new(MockClient::new("mock", "mock://"));
    let (aggregator, _store) = aggregator_for(vec![client]);

    let reports: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let options = ExecuteOptions {
        progress: Some(Arc::new(move |finished, total| {
            sink.lock().unwrap().push((finished, total));
        })),
        ..ExecuteOptions::best_effort()
    };

    let channels = targets(vec![
        video_channel("mock://a", None),
        video_channel("mock://b", None),
        video_channel("mock://c", None),
    ]);
    aggregator.plan_and_execute(&channels, &options).await.unwrap();

    let mut reports = reports.lock().unwrap().clone();
    reports.sort();
    assert_eq!(reports, vec![(1, 3), (2, 3), (3, 3)]);
}

#[tokio::test]
async fn peek_tasks_probe_without_joining_the_feed() {
    init_tracing();
    let fresh_item = item("https://peek.example/new", "mock://peeky", "mock", hours_ago(1));
    let client = Arc::new(
        MockClient::new("mock", "mock://")
            .with_rate_limit(1)
            .with_peek_types(vec![subfeed::ContentType::Video])
            .with_items(
                "mock://live",
                vec![item("https://live.example/1", "mock://live", "mock", hours_ago(2))],
            )
            .with_items("mock://peeky", vec![fresh_item.clone()]),
    );
    let (aggregator, store) = aggregator_for(vec![client.clone()]);

    let channels = targets(vec![
        video_channel("mock://live", Some(days_ago(9))),
        video_channel("mock://peeky", Some(days_ago(1))),
    ]);
    let (mut feed, errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();
    assert!(errors.is_empty());

    // The peeked channel contributes nothing to the merged result...
    let all = collect_all(&mut feed).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].url, "https://live.example/1");
    assert_eq!(client.peek_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // ...but its fresh items land in the cache and its peek time is stamped.
    aggregator.jobs().drain().await;
    assert!(aggregator.cache().get(&fresh_item.url).await.is_some());
    assert!(store.get("mock://peeky").await.unwrap().last_peeked.is_some());
}

#[tokio::test]
async fn cancelled_best_effort_run_returns_what_completed() {
    init_tracing();
    let client = Arc::new(MockClient::new("mock", "mock://"));
    let (aggregator, _store) = aggregator_for(vec![client.clone()]);

    let cancel = CancelToken::new();
    cancel.cancel();
    let options = ExecuteOptions {
        cancel: cancel.clone(),
        ..ExecuteOptions::best_effort()
    };
    let channels = targets(vec![video_channel("mock://a", None)]);
    let (mut feed, errors) = aggregator.plan_and_execute(&channels, &options).await.unwrap();

    assert_eq!(client.fetch_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], AggregatorError::Cancelled));
    // The merged pager stops pulling new pages but stays usable.
    assert!(feed.next_page().await.unwrap().is_empty());
}

#[tokio::test]
async fn cancelled_strict_run_surfaces_the_cancellation() {
    init_tracing();
    let client = Arc::new(MockClient::new("mock", "mock://"));
    let (aggregator, _store) = aggregator_for(vec![client]);

    let cancel = CancelToken::new();
    cancel.cancel();
    let options = ExecuteOptions {
        allow_failure: false,
        with_cache_fallback: true,
        cancel,
        ..ExecuteOptions::default()
    };
    let channels = targets(vec![video_channel("mock://a", None)]);
    let result = aggregator.plan_and_execute(&channels, &options).await;
    assert!(matches!(result, Err(AggregatorError::Cancelled)));
}

#[tokio::test]
async fn duplicate_items_across_channels_appear_once() {
    init_tracing();
    let shared_ts = hours_ago(2);
    let client = Arc::new(
        MockClient::new("mock", "mock://")
            .with_items(
                "mock://a",
                vec![
                    item("https://dup.example/v", "mock://a", "mock", hours_ago(1)),
                    item("https://a.example/1", "mock://a", "mock", shared_ts),
                ],
            )
            .with_items(
                "mock://b",
                vec![item("https://dup.example/v/", "mock://b", "mock", hours_ago(3))],
            ),
    );
    let (aggregator, _store) = aggregator_for(vec![client]);

    let channels = targets(vec![
        video_channel("mock://a", None),
        video_channel("mock://b", None),
    ]);
    let (mut feed, _errors) = aggregator
        .plan_and_execute(&channels, &ExecuteOptions::best_effort())
        .await
        .unwrap();

    let all = collect_all(&mut feed).await.unwrap();
    let dups: Vec<_> = all
        .iter()
        .filter(|i| i.canonical_url() == "https://dup.example/v")
        .collect();
    assert_eq!(dups.len(), 1);
    assert_eq!(all.len(), 2);
}
