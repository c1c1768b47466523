mod common;

use common::*;
use pomaarcore::config::QueuePolicy;
use pomaarcore::interface::capture::RawFrame;
use pomaarcore::prelude::ParseError;
use pomaarcore::StreamingPipeline;
use tokio::sync::watch;

fn frames(count: u32) -> Vec<Result<RawFrame, ParseError>> {
    let config = point_target_config();
    generator(&config, point_target_scene(31))
        .frames(count)
        .unwrap()
        .into_iter()
        .map(Ok)
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_matches_sequential_processing() {
    init_logging();
    let mut config = point_target_config();
    config.stream.queue_depth = 1;
    let input = frames(4);

    let sequential = pipeline(&config).run(input.clone()).unwrap();
    let streaming = StreamingPipeline::new(pipeline(&config));
    let (_tx, shutdown) = watch::channel(false);
    let streamed = streaming.run(input, shutdown).await.unwrap();

    assert_eq!(streamed, sequential);
    assert_eq!(streaming.pipeline().metrics().frames_processed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn parse_errors_are_skipped_in_stream() {
    let config = point_target_config();
    let mut input = frames(3);
    input.insert(
        1,
        Err(ParseError::Truncated {
            expected: 100,
            found: 10,
        }),
    );

    let streaming = StreamingPipeline::new(pipeline(&config));
    let (_tx, shutdown) = watch::channel(false);
    let reports = streaming.run(input, shutdown).await.unwrap();

    let indices: Vec<u32> = reports.iter().map(|r| r.frame_index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    let metrics = streaming.pipeline().metrics();
    assert_eq!(metrics.frames_skipped, 1);
    assert_eq!(metrics.frames_processed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_ingestion() {
    let config = point_target_config();
    let streaming = StreamingPipeline::new(pipeline(&config));
    let (tx, shutdown) = watch::channel(false);
    tx.send(true).unwrap();

    let reports = streaming.run(frames(3), shutdown).await.unwrap();
    assert!(reports.is_empty());
    assert_eq!(streaming.pipeline().metrics().frames_processed, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn drop_oldest_never_reorders_frames() {
    let mut config = point_target_config();
    config.stream.queue_depth = 1;
    config.stream.policy = QueuePolicy::DropOldest;

    let streaming = StreamingPipeline::new(pipeline(&config));
    let (_tx, shutdown) = watch::channel(false);
    let reports = streaming.run(frames(6), shutdown).await.unwrap();

    let indices: Vec<u32> = reports.iter().map(|r| r.frame_index).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]), "{:?}", indices);
    assert!(indices.last().copied() == Some(5));
    let metrics = streaming.pipeline().metrics();
    assert_eq!(
        metrics.frames_processed + metrics.frames_dropped,
        6,
        "{:?}",
        metrics
    );
}
