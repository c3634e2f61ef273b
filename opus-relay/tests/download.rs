use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use opus_relay::{
    BoxedReader, ByteSource, CandidateFormat, ContentDescriptor, DownloadOptions, Downloader,
    ErrorKind, RelayError, RelayPath, ResolveError, ResolveOptions, Resolver, Selection,
    StreamEvent, TranscodeConfig,
};
use webm::encode;

fn opus_format() -> CandidateFormat {
    CandidateFormat {
        format_id: "251".to_string(),
        codec: "opus".to_string(),
        container: "webm".to_string(),
        audio_sample_rate: Some(48000),
        audio_bitrate: Some(160),
        bitrate: Some(160),
        audio_only: true,
        is_hls: false,
        url: "memory://251".to_string(),
        http_headers: BTreeMap::new(),
    }
}

fn aac_format() -> CandidateFormat {
    CandidateFormat {
        format_id: "140".to_string(),
        codec: "mp4a.40.2".to_string(),
        container: "m4a".to_string(),
        audio_sample_rate: Some(44100),
        audio_bitrate: Some(128),
        bitrate: Some(130),
        audio_only: true,
        is_hls: false,
        url: "memory://140".to_string(),
        http_headers: BTreeMap::new(),
    }
}

fn descriptor(formats: Vec<CandidateFormat>) -> ContentDescriptor {
    ContentDescriptor {
        id: "song".to_string(),
        title: "A Song".to_string(),
        duration_secs: 180,
        is_live: false,
        formats,
    }
}

struct MemoryResolver {
    descriptor: ContentDescriptor,
    gate: Option<Arc<Notify>>,
}

impl MemoryResolver {
    fn new(descriptor: ContentDescriptor) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            gate: None,
        })
    }
}

#[async_trait]
impl Resolver for MemoryResolver {
    async fn resolve(
        &self,
        _locator: &str,
        _options: &ResolveOptions,
    ) -> Result<ContentDescriptor, ResolveError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.descriptor.clone())
    }
}

/// Serves either a fixed WebM payload or a live pipe fed by the test.
#[derive(Default)]
struct MemorySource {
    payload: Option<Bytes>,
    pipe: Mutex<Option<DuplexStream>>,
    opens: AtomicUsize,
}

impl MemorySource {
    fn fixed(payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            payload: Some(payload),
            ..Default::default()
        })
    }

    fn piped() -> (Arc<Self>, DuplexStream) {
        let (reader, writer) = tokio::io::duplex(64);
        let source = Arc::new(Self {
            pipe: Mutex::new(Some(reader)),
            ..Default::default()
        });
        (source, writer)
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn open(
        &self,
        _descriptor: &ContentDescriptor,
        _format: &CandidateFormat,
    ) -> Result<BoxedReader, RelayError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(payload) = &self.payload {
            return Ok(Box::new(std::io::Cursor::new(payload.to_vec())));
        }
        let pipe = self.pipe.lock().unwrap().take();
        pipe.map(|p| Box::new(p) as BoxedReader)
            .ok_or_else(|| RelayError::config("pipe already opened"))
    }
}

fn downloader(resolver: Arc<dyn Resolver>, source: Arc<dyn ByteSource>) -> Downloader {
    Downloader::with_collaborators(resolver, source, DownloadOptions::default()).unwrap()
}

/// WebM header and track list without any cluster.
fn webm_head() -> Bytes {
    let head = encode::opus_head_bytes(2, 312, 48000);
    let mut out = BytesMut::new();
    out.put(encode::ebml_header("webm"));
    out.put(encode::segment_start());
    out.put(encode::tracks(&[encode::track_entry(1, "A_OPUS", Some(&head))]));
    out.freeze()
}

fn one_packet_cluster(timecode: u64, packet: &[u8]) -> Bytes {
    encode::cluster(timecode, &[encode::simple_block(1, 0, packet)])
}

#[tokio::test]
async fn remux_end_to_end() {
    let packets: [&[u8]; 3] = [b"first packet", b"second", b"third packet"];
    let source = MemorySource::fixed(encode::opus_stream(&packets));
    let d = downloader(
        MemoryResolver::new(descriptor(vec![aac_format(), opus_format()])),
        source.clone(),
    );

    let mut stream = d.download("https://www.youtube.com/watch?v=song");
    let mut events = Vec::new();
    while let Some(event) = stream.next_event().await {
        events.push(event);
    }

    assert_eq!(events.len(), 5, "{events:?}");
    match &events[0] {
        StreamEvent::Info(info) => {
            assert_eq!(info.path, RelayPath::Remux);
            assert_eq!(info.format.format_id, "251");
            assert_eq!(info.descriptor.title, "A Song");
        }
        other => panic!("expected info first, got {other:?}"),
    }
    for (event, expected) in events[1..4].iter().zip(packets) {
        match event {
            StreamEvent::Data(bytes) => {
                assert!(!bytes.is_empty());
                assert_eq!(bytes.as_ref(), expected);
            }
            other => panic!("expected data, got {other:?}"),
        }
    }
    assert!(matches!(events[4], StreamEvent::End));
    assert_eq!(source.opens(), 1);
    assert!(stream.info().is_some());
}

#[tokio::test]
async fn small_high_water_mark_keeps_order() {
    let payloads: Vec<Vec<u8>> = (0..64u8).map(|i| vec![i; 40]).collect();
    let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
    let source = MemorySource::fixed(encode::opus_stream(&refs));
    let d = Downloader::with_collaborators(
        MemoryResolver::new(descriptor(vec![opus_format()])),
        source,
        DownloadOptions::default().with_high_water_mark(64),
    )
    .unwrap();

    let mut stream = d.download("locator");
    let mut received = Vec::new();
    while let Some(frame) = stream.next_frame().await {
        received.push(frame.unwrap());
        tokio::task::yield_now().await;
    }
    assert_eq!(received.len(), 64);
    for (i, frame) in received.iter().enumerate() {
        assert_eq!(frame.as_ref(), payloads[i].as_slice());
    }
}

#[tokio::test]
async fn destroy_before_info_starts_no_relay() {
    let gate = Arc::new(Notify::new());
    let resolver = Arc::new(MemoryResolver {
        descriptor: descriptor(vec![opus_format()]),
        gate: Some(gate.clone()),
    });
    let source = MemorySource::fixed(encode::opus_stream(&[b"never"]));
    let d = downloader(resolver, source.clone());

    let mut stream = d.download("locator");
    stream.destroy();
    stream.destroy();
    gate.notify_one();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stream.next_event().await.is_none());
    assert_eq!(source.opens(), 0);
}

#[tokio::test]
async fn destroy_during_demux_stops_data() {
    let (source, mut writer) = MemorySource::piped();
    let d = downloader(
        MemoryResolver::new(descriptor(vec![opus_format()])),
        source.clone(),
    );
    let mut stream = d.download("locator");

    assert!(matches!(stream.next_event().await, Some(StreamEvent::Info(_))));

    writer.write_all(&webm_head()).await.unwrap();
    writer.write_all(&one_packet_cluster(0, b"p0")).await.unwrap();
    writer.write_all(&one_packet_cluster(20, b"p1")).await.unwrap();

    match stream.next_event().await {
        Some(StreamEvent::Data(bytes)) => assert_eq!(bytes, "p0"),
        other => panic!("expected data, got {other:?}"),
    }

    stream.destroy();
    assert!(stream.next_event().await.is_none());

    // The relay drops the source once it sees the cancellation, which breaks
    // the pipe for the writer.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if writer
                .write_all(&one_packet_cluster(40, b"late"))
                .await
                .is_err()
            {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "source was not released after destroy");
    assert!(stream.next_event().await.is_none());
}

#[tokio::test]
async fn dropping_stream_releases_source() {
    let (source, mut writer) = MemorySource::piped();
    let d = downloader(
        MemoryResolver::new(descriptor(vec![opus_format()])),
        source.clone(),
    );
    let mut stream = d.download("locator");
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Info(_))));
    writer.write_all(&webm_head()).await.unwrap();
    writer.write_all(&one_packet_cluster(0, b"p0")).await.unwrap();

    // First data proves the relay owns the pipe.
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Data(_))));
    assert_eq!(source.opens(), 1);
    drop(stream);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while writer
            .write_all(&one_packet_cluster(20, b"x"))
            .await
            .is_ok()
        {}
    })
    .await;
    assert!(closed.is_ok(), "source was not released after drop");
}

#[tokio::test]
async fn dropping_stream_after_info_starts_no_relay() {
    let (source, _writer) = MemorySource::piped();
    let d = downloader(
        MemoryResolver::new(descriptor(vec![opus_format()])),
        source.clone(),
    );
    let mut stream = d.download("locator");
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Info(_))));
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.opens(), 0);
}

#[tokio::test]
async fn no_suitable_format_is_error_without_relay() {
    let mut video_only = aac_format();
    video_only.codec = "none".to_string();
    video_only.audio_bitrate = None;
    let source = MemorySource::fixed(Bytes::new());
    let d = downloader(
        MemoryResolver::new(descriptor(vec![video_only])),
        source.clone(),
    );

    let mut stream = d.download("locator");
    match stream.next_event().await {
        Some(StreamEvent::Error(e)) => {
            assert!(matches!(e, RelayError::NoSuitableFormat));
            assert_eq!(e.kind(), ErrorKind::Selection);
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(stream.next_event().await.is_none());
    assert_eq!(source.opens(), 0);
}

#[tokio::test]
async fn demux_error_is_terminal() {
    let source = MemorySource::fixed(Bytes::from_static(b"\x00\x01not a webm file"));
    let d = downloader(
        MemoryResolver::new(descriptor(vec![opus_format()])),
        source,
    );

    let mut stream = d.download("locator");
    assert!(matches!(stream.next_event().await, Some(StreamEvent::Info(_))));
    match stream.next_event().await {
        Some(StreamEvent::Error(e)) => assert_eq!(e.kind(), ErrorKind::Demux),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(stream.next_event().await.is_none());
}

#[tokio::test]
async fn live_content_never_remuxes() {
    let mut live_opus = opus_format();
    live_opus.is_hls = true;
    let mut live = descriptor(vec![live_opus]);
    live.is_live = true;
    live.duration_secs = 0;

    let source = MemorySource::fixed(Bytes::new());
    let options = DownloadOptions::default().with_transcode(
        TranscodeConfig::default().with_ffmpeg_path("definitely-not-ffmpeg-4711"),
    );
    let d = Downloader::with_collaborators(MemoryResolver::new(live.clone()), source.clone(), options)
        .unwrap();

    let (_, selection) = d.plan("locator").await.unwrap();
    assert!(matches!(selection, Selection::Transcode(_)));

    let mut stream = d.download_with_info(live);
    match stream.next_event().await {
        Some(StreamEvent::Info(info)) => assert_eq!(info.path, RelayPath::Transcode),
        other => panic!("expected info, got {other:?}"),
    }
    match stream.next_event().await {
        Some(StreamEvent::Error(e)) => assert!(matches!(e, RelayError::Spawn { .. })),
        other => panic!("expected spawn error, got {other:?}"),
    }
    assert_eq!(source.opens(), 0);
}

#[tokio::test]
async fn get_info_rejects_invalid_descriptor() {
    let mut broken = opus_format();
    broken.url = " ".to_string();
    let d = downloader(
        MemoryResolver::new(descriptor(vec![broken])),
        MemorySource::fixed(Bytes::new()),
    );

    let err = d.get_info("locator").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolution);
}
