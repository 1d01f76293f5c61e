use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use faceforge_core::{FetchError, ImageSource};
use faceforge_daemon::{router, AppState, GenerationInputs, ImageGenerator};
use faceforge_runtime_api::{
    BoundingBox, DetectedFace, DiffusionModel, FaceAnalyzer, FaceEmbedding, GenerationParams,
    ImageGenRequest,
};
use image::RgbImage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

const PERSON_URL: &str = "http://images.test/person.jpg";
const NO_FACE_URL: &str = "http://images.test/landscape.jpg";

/// Serves fixed images; unknown URLs answer 404
struct FakeImages {
    images: HashMap<String, RgbImage>,
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn fetch(&self, url: &str) -> Result<RgbImage, FetchError> {
        self.images.get(url).cloned().ok_or_else(|| FetchError::Status {
            url: url.to_string(),
            status: StatusCode::NOT_FOUND,
        })
    }
}

/// Finds one face in non-black images
struct FakeFaces;

impl FaceAnalyzer for FakeFaces {
    fn analyze(&self, image: &RgbImage) -> Result<Vec<DetectedFace>> {
        if image.pixels().all(|p| p.0 == [0, 0, 0]) {
            return Ok(Vec::new());
        }
        Ok(vec![DetectedFace {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 4.0,
                y2: 4.0,
            },
            score: 0.9,
            landmarks: [(1.0, 1.0); 5],
            embedding: FaceEmbedding::new(vec![0.5; 512]),
        }])
    }
}

/// Face analysis that errors on every image
struct BrokenFaces;

impl FaceAnalyzer for BrokenFaces {
    fn analyze(&self, _image: &RgbImage) -> Result<Vec<DetectedFace>> {
        anyhow::bail!("detector session poisoned")
    }
}

/// Face analysis that panics on every image
struct PanickingFaces;

impl FaceAnalyzer for PanickingFaces {
    fn analyze(&self, _image: &RgbImage) -> Result<Vec<DetectedFace>> {
        panic!("landmark index out of range")
    }
}

#[derive(Default)]
struct RecordingPipeline {
    calls: Mutex<Vec<(String, GenerationParams)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_with: Option<&'static str>,
    delay: Duration,
}

impl DiffusionModel for RecordingPipeline {
    fn generate(&self, request: &ImageGenRequest) -> Result<RgbImage> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.calls
            .lock()
            .unwrap()
            .push((request.prompt.clone(), request.params));
        self.active.fetch_sub(1, Ordering::SeqCst);

        match self.fail_with {
            Some(message) => anyhow::bail!(message),
            None => Ok(RgbImage::from_pixel(16, 16, image::Rgb([120, 80, 40]))),
        }
    }

    fn name(&self) -> &str {
        "recording"
    }
}

fn generator(
    pipeline: Arc<RecordingPipeline>,
    faces: Arc<dyn FaceAnalyzer>,
    serialized: bool,
) -> ImageGenerator {
    let images = FakeImages {
        images: HashMap::from([
            (
                PERSON_URL.to_string(),
                RgbImage::from_pixel(8, 8, image::Rgb([200, 170, 150])),
            ),
            (NO_FACE_URL.to_string(), RgbImage::new(8, 8)),
        ]),
    };
    ImageGenerator::new(Arc::new(images), faces, pipeline).serialized(serialized)
}

fn app(pipeline: Arc<RecordingPipeline>, serialized: bool) -> Router {
    app_with_faces(pipeline, Arc::new(FakeFaces), serialized)
}

fn app_with_faces(
    pipeline: Arc<RecordingPipeline>,
    faces: Arc<dyn FaceAnalyzer>,
    serialized: bool,
) -> Router {
    router(Arc::new(AppState::new(generator(pipeline, faces, serialized))))
}

async fn invoke(app: Router, body: impl Into<Body>) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::post("/invocations")
                .header("content-type", "application/json")
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn ping(app: Router) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn ping_reports_healthy() {
    let (status, body) = ping(app(Arc::default(), true)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "healthy" }));
}

#[tokio::test]
async fn missing_person_image_is_a_client_error() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let app = app(pipeline.clone(), true);

    for body in [
        json!({ "prompt": "hello" }),
        json!({ "person_image": "" }),
        json!({ "person_image": null, "clothing_images": [PERSON_URL] }),
    ] {
        let (status, response) = invoke(app.clone(), body.to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, json!({ "error": "person_image is required" }));
    }
    assert!(pipeline.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn successful_invocation_returns_base64_jpeg() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let (status, body) = invoke(
        app(pipeline.clone(), true),
        json!({
            "person_image": PERSON_URL,
            "clothing_images": ["http://images.test/shirt.jpg"],
            "place_image": "http://images.test/beach.jpg",
            "prompt": "portrait at golden hour"
        })
        .to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let jpeg = BASE64_STANDARD
        .decode(body["generated_image"].as_str().unwrap())
        .unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 16));

    let calls = pipeline.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "portrait at golden hour");
}

#[tokio::test]
async fn prompt_defaults_when_omitted() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let (status, _) = invoke(
        app(pipeline.clone(), true),
        json!({ "person_image": PERSON_URL }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.calls.lock().unwrap()[0].0, "A photorealistic portrait");
}

#[tokio::test]
async fn unreachable_image_fails_and_service_keeps_serving() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let app = app(pipeline.clone(), true);

    let (status, body) = invoke(
        app.clone(),
        json!({ "person_image": "http://images.test/missing.jpg" }).to_string(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Could not download person image");

    let (status, _) = ping(app.clone()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = invoke(app, json!({ "person_image": PERSON_URL }).to_string()).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn faceless_image_never_reaches_the_pipeline() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let (status, body) = invoke(
        app(pipeline.clone(), true),
        json!({ "person_image": NO_FACE_URL }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Could not extract face features");
    assert!(pipeline.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn face_analysis_faults_count_as_no_face() {
    let analyzers: [Arc<dyn FaceAnalyzer>; 2] = [Arc::new(BrokenFaces), Arc::new(PanickingFaces)];

    for faces in analyzers {
        let pipeline = Arc::new(RecordingPipeline::default());
        let (status, body) = invoke(
            app_with_faces(pipeline.clone(), faces, true),
            json!({ "person_image": PERSON_URL }).to_string(),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({ "error": "Could not extract face features" }));
        assert!(pipeline.calls.lock().unwrap().is_empty());
    }
}

#[tokio::test]
async fn pipeline_failure_message_is_returned() {
    let pipeline = Arc::new(RecordingPipeline {
        fail_with: Some("CUDA out of memory"),
        ..Default::default()
    });
    let (status, body) = invoke(
        app(pipeline, true),
        json!({ "person_image": PERSON_URL }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "CUDA out of memory");
}

#[tokio::test]
async fn malformed_body_is_a_server_error() {
    let (status, body) = invoke(app(Arc::default(), true), "{not json").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn non_object_body_is_a_server_error() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let app = app(pipeline.clone(), true);

    for body in [json!([]), json!([PERSON_URL]), json!(PERSON_URL)] {
        let (status, response) = invoke(app.clone(), body.to_string()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("Request body must be a JSON object"));
    }
    assert!(pipeline.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn falsy_person_image_is_a_client_error() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let app = app(pipeline.clone(), true);

    for person_image in [json!(false), json!(0), json!([])] {
        let (status, response) =
            invoke(app.clone(), json!({ "person_image": person_image }).to_string()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response, json!({ "error": "person_image is required" }));
    }
    assert!(pipeline.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn null_prompt_uses_the_default() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let (status, _) = invoke(
        app(pipeline.clone(), true),
        json!({ "person_image": PERSON_URL, "prompt": null }).to_string(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(pipeline.calls.lock().unwrap()[0].0, "A photorealistic portrait");
}

#[tokio::test]
async fn every_request_uses_the_same_sampling_parameters() {
    let pipeline = Arc::new(RecordingPipeline::default());
    let app = app(pipeline.clone(), true);

    for prompt in ["first", "second"] {
        let (status, _) = invoke(
            app.clone(),
            json!({ "person_image": PERSON_URL, "prompt": prompt }).to_string(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let calls = pipeline.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1, GenerationParams::default());
    assert_eq!(calls[0].1, calls[1].1);
    assert_eq!(calls[0].1.seed, 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serialized_generation_runs_one_at_a_time() {
    let pipeline = Arc::new(RecordingPipeline {
        delay: Duration::from_millis(100),
        ..Default::default()
    });
    let app = app(pipeline.clone(), true);
    let body = json!({ "person_image": PERSON_URL }).to_string();

    let (a, b, c) = tokio::join!(
        invoke(app.clone(), body.clone()),
        invoke(app.clone(), body.clone()),
        invoke(app, body),
    );

    assert!([a.0, b.0, c.0].iter().all(|s| *s == StatusCode::OK));
    assert_eq!(pipeline.calls.lock().unwrap().len(), 3);
    assert_eq!(pipeline.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_request_keeps_the_pipeline_gated() {
    let pipeline = Arc::new(RecordingPipeline {
        delay: Duration::from_millis(300),
        ..Default::default()
    });
    let generator = Arc::new(generator(pipeline.clone(), Arc::new(FakeFaces), true));
    let inputs = GenerationInputs {
        person_image: PERSON_URL.to_string(),
        clothing_images: Vec::new(),
        place_image: None,
        prompt: "portrait".to_string(),
    };

    let first = {
        let generator = generator.clone();
        let inputs = inputs.clone();
        tokio::spawn(async move { generator.generate(&inputs).await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    first.abort();
    assert!(first.await.unwrap_err().is_cancelled());

    generator.generate(&inputs).await.unwrap();

    assert_eq!(pipeline.calls.lock().unwrap().len(), 2);
    assert_eq!(pipeline.max_active.load(Ordering::SeqCst), 1);
}
