//! palm_demo - enrol and authenticate one palm end to end through the message queue

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use palm_id::{
    Envelope, Event, Liveness, MatchRequest, MessageType, ModelId, PalmConfig, PalmFrame,
    PalmType, Session, SessionBuilder, Status, Strictness,
};

const FRAME_SIZE: u32 = 128;
const WAIT_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Level {
    Minimum,
    Authenticate,
    Medium,
    Enrollment,
    Maximum,
}

impl From<Level> for Strictness {
    fn from(level: Level) -> Self {
        match level {
            Level::Minimum => Strictness::Minimum,
            Level::Authenticate => Strictness::Authenticate,
            Level::Medium => Strictness::Medium,
            Level::Enrollment => Strictness::Enrollment,
            Level::Maximum => Strictness::Maximum,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Palm print image (BMP/PNG/JPEG) used for every frame instead of a synthetic palm.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Persist enrolled models in this SQLite database.
    #[arg(long, env = "PALM_MODEL_DB")]
    db: Option<String>,
    /// Capture strictness.
    #[arg(long, value_enum, default_value_t = Level::Medium)]
    strictness: Level,
    /// Score a match must reach.
    #[arg(long, default_value_t = 0.8)]
    threshold: f32,
    /// Frames fed to each capture before giving up.
    #[arg(long, default_value_t = 60)]
    max_frames: u32,
    /// Seed of the synthetic palm texture.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = PalmConfig::load()?;
    if let Some(db) = &args.db {
        cfg.model_db_path = Some(db.clone());
    }
    let session = SessionBuilder::new().config(cfg).build()?;
    let strictness = Strictness::from(args.strictness);

    let image_bytes = match &args.image {
        Some(path) => Some(
            std::fs::read(path).with_context(|| format!("read {}", path.display()))?,
        ),
        None => None,
    };
    let palm = |frame_index: u32, seed: u64| -> Result<PalmFrame> {
        match &image_bytes {
            Some(bytes) => {
                let mut frame = PalmFrame::new();
                frame.add_image_from_file(bytes, PalmType::Print)?;
                Ok(frame)
            }
            None => synthetic_frame(seed, frame_index),
        }
    };

    stage("enrol");
    let (enrolled_id, enrolled) =
        capture_template(&session, strictness, args.max_frames, |i| palm(i, args.seed))?;
    session.add_model(&enrolled)?;
    let added = wait_for(&session, MessageType::AddModelResult)?;
    match added.event {
        Event::AddModelResult(r) if r.success => println!("  enrolled model {}", r.model_id),
        Event::AddModelResult(r) => println!("  model {} was already enrolled", r.model_id),
        other => return Err(anyhow!("unexpected add result {:?}", other)),
    }

    stage("authenticate genuine palm");
    let (_, probe) = capture_template(&session, strictness, args.max_frames, |i| {
        palm(i + 1000, args.seed)
    })?;
    let genuine = run_match(&session, probe, enrolled_id, args.threshold)?;

    stage("authenticate impostor palm");
    let impostor = if image_bytes.is_some() {
        None
    } else {
        let (_, other) = capture_template(&session, strictness, args.max_frames, |i| {
            palm(i, args.seed.wrapping_add(1))
        })?;
        Some(run_match(&session, other, enrolled_id, args.threshold)?)
    };

    println!("demo summary:");
    println!("  enrolled model: {}", enrolled_id);
    println!("  genuine score: {}", describe(genuine));
    if let Some(score) = impostor {
        println!("  impostor score: {}", describe(score));
    }
    if let Some(db) = &session.config().model_db_path {
        println!("  model db: {}", db);
    }

    session
        .destroy()
        .map_err(|e| anyhow!("destroy session: {}", e))?;
    Ok(())
}

fn stage(msg: &str) {
    eprintln!("palm_demo: {}", msg);
}

fn describe(score: Option<f32>) -> String {
    match score {
        Some(score) => format!("{:.3} (match)", score),
        None => "no match".to_string(),
    }
}

/// Arm a capture and feed frames until the CaptureResult arrives.
fn capture_template(
    session: &Session,
    strictness: Strictness,
    max_frames: u32,
    mut next_frame: impl FnMut(u32) -> Result<PalmFrame>,
) -> Result<(ModelId, Vec<u8>)> {
    session.capture(strictness, Liveness::None)?;
    for i in 0..max_frames {
        let frame = next_frame(i)?;
        session.process_frame(&frame)?;
        while let Some(message) = session.wait_message(Duration::ZERO)? {
            let envelope = message.into_envelope();
            if let Event::CaptureResult(result) = envelope.event {
                if envelope.status != Status::Success {
                    return Err(anyhow!("capture failed: {}", envelope.status));
                }
                println!(
                    "  captured model {} ({:?}, {} bytes)",
                    result.model_id,
                    result.sidedness,
                    result.data.len()
                );
                return Ok((result.model_id, result.data));
            }
        }
    }
    Err(anyhow!("no capture after {} frames", max_frames))
}

fn run_match(
    session: &Session,
    live_model: Vec<u8>,
    enrolled: ModelId,
    threshold: f32,
) -> Result<Option<f32>> {
    session.match_models(MatchRequest {
        live_model,
        model_ids: vec![enrolled],
        modality: PalmType::Print,
        score_threshold: threshold,
        update_model: false,
    })?;
    let envelope = wait_for(session, MessageType::MatchingResult)?;
    if envelope.status != Status::Success {
        return Err(anyhow!("matching failed: {}", envelope.status));
    }
    match envelope.event {
        Event::MatchingResult(result) => Ok(result.matches.first().map(|m| m.score)),
        other => Err(anyhow!("unexpected matching result {:?}", other)),
    }
}

/// Drain messages until one of `wanted` arrives. Others are logged and released.
fn wait_for(session: &Session, wanted: MessageType) -> Result<Envelope> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let Some(message) = session.wait_message(WAIT_SLICE)? else {
            continue;
        };
        if message.message_type() == wanted {
            return Ok(message.into_envelope());
        }
        log::debug!("skipping {:?} ({})", message.message_type(), message.status());
    }
    Err(anyhow!("timed out waiting for {:?}", wanted))
}

/// A lit palm on a dark background. The texture is fixed by `seed`; each
/// frame adds a little sensor noise.
fn synthetic_frame(seed: u64, frame_index: u32) -> Result<PalmFrame> {
    let mut texture = StdRng::seed_from_u64(seed);
    let waves: Vec<(f32, f32, f32)> = (0..6)
        .map(|_| {
            (
                texture.gen_range(0.05..0.4),
                texture.gen_range(0.05..0.4),
                texture.gen_range(0.0..std::f32::consts::TAU),
            )
        })
        .collect();
    let mut noise = StdRng::seed_from_u64(seed ^ ((frame_index as u64) << 32));

    let mut frame = PalmFrame::new();
    for (palm_type, depth) in [(PalmType::Print, 8), (PalmType::Vein, 24)] {
        let image = frame
            .add_image(FRAME_SIZE, FRAME_SIZE, depth, palm_type)?
            .ok_or_else(|| anyhow!("frame is full"))?;
        let (lo, hi) = (FRAME_SIZE / 4, FRAME_SIZE * 3 / 4);
        for y in 0..FRAME_SIZE {
            for x in 0..FRAME_SIZE {
                let inside = (lo..hi).contains(&x) && (lo..hi).contains(&y);
                let value = if inside {
                    let wave: f32 = waves
                        .iter()
                        .map(|(fx, fy, phase)| (fx * x as f32 + fy * y as f32 + phase).sin())
                        .sum::<f32>()
                        / waves.len() as f32;
                    let jitter: f32 = noise.gen_range(-4.0..4.0);
                    (180.0 + 30.0 * wave + jitter).clamp(150.0, 215.0) as u8
                } else {
                    20
                };
                image.set_luma(x, y, value);
            }
        }
    }
    Ok(frame)
}
