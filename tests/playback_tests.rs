// Playback scheduling tests
//
// The clock is paused so chunk boundaries can be checked exactly.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use triage_voice::audio::{AudioChunk, NullSink, PlaybackEvent, PlaybackScheduler, WavSink};

fn chunk(duration: Duration, rate: u32) -> AudioChunk {
    let samples = (rate as u128 * duration.as_millis() / 1000) as usize;
    AudioChunk::new(vec![0.25; samples], rate)
}

async fn wait_drained(events: &mut mpsc::UnboundedReceiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let done = event == PlaybackEvent::Drained;
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn test_burst_plays_back_to_back() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::spawn(Box::new(NullSink::default()), tx);
    let t0 = Instant::now();
    let d = Duration::from_millis(100);

    let slots: Vec<_> = (0..3)
        .map(|_| scheduler.enqueue(chunk(d, 16000)).unwrap())
        .collect();
    assert_eq!(scheduler.depth(), 3);

    assert_eq!(slots[0].start, t0);
    assert_eq!(slots[1].start, t0 + d);
    assert_eq!(slots[2].start, t0 + d * 2);
    assert_eq!(slots[2].end, t0 + d * 3);

    let mut started_at = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            PlaybackEvent::Started(slot) => {
                assert_eq!(Instant::now(), slot.start);
                started_at.push(slot.start - t0);
            }
            PlaybackEvent::Drained => break,
            _ => {}
        }
    }

    assert_eq!(started_at, vec![Duration::ZERO, d, d * 2]);
    assert_eq!(Instant::now() - t0, d * 3);
    assert!(scheduler.is_idle());

    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_chunk_starts_at_previous_end() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::spawn(Box::new(NullSink::default()), tx);
    let t0 = Instant::now();

    let first = scheduler.enqueue(chunk(Duration::from_millis(100), 16000)).unwrap();

    // Arrives while the first chunk is still playing
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = scheduler.enqueue(chunk(Duration::from_millis(100), 16000)).unwrap();
    assert_eq!(second.start, first.end);
    assert_eq!(second.index, 1);

    let seen = wait_drained(&mut events).await;
    let drains = seen.iter().filter(|e| **e == PlaybackEvent::Drained).count();
    assert_eq!(drains, 1, "one drain for the whole burst");
    assert_eq!(Instant::now() - t0, Duration::from_millis(200));

    // After a gap the next chunk plays immediately
    tokio::time::sleep(Duration::from_millis(500)).await;
    let now = Instant::now();
    let third = scheduler.enqueue(chunk(Duration::from_millis(50), 16000)).unwrap();
    assert_eq!(third.start, now);

    wait_drained(&mut events).await;
    scheduler.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_discards_queue_without_drain() {
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::spawn(Box::new(NullSink::default()), tx);

    scheduler.enqueue(chunk(Duration::from_millis(100), 16000)).unwrap();
    scheduler.enqueue(chunk(Duration::from_millis(100), 16000)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    scheduler.shutdown().await;
    assert_eq!(scheduler.depth(), 0);
    assert!(scheduler.enqueue(chunk(Duration::from_millis(10), 16000)).is_none());

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(PlaybackEvent::Started(slot)) if slot.index == 0));
    assert!(!seen.contains(&PlaybackEvent::Drained));
}

#[tokio::test]
async fn test_wav_sink_records_at_output_rate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.wav");

    let sink = WavSink::create(path.clone(), 16000).unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    let mut scheduler = PlaybackScheduler::spawn(Box::new(sink), tx);

    // 8kHz input is upsampled to the file's 16kHz
    scheduler.enqueue(chunk(Duration::from_millis(50), 8000)).unwrap();
    scheduler.enqueue(chunk(Duration::from_millis(50), 16000)).unwrap();
    wait_drained(&mut events).await;
    scheduler.shutdown().await;

    let mut reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.bits_per_sample, 16);

    let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(samples.len(), 1600);
    assert!(samples.iter().all(|&s| s == 8192));
}
