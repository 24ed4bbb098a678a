// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 合成挥杆回放 - 走完整流水线: 合成帧 → 工作线程 → 状态机 → 击球记录
///
/// 直接运行: cargo run --bin golfshot --release -- --layout detection-major --jitter 0.5
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mimalloc::MiMalloc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use golfshot_rs::synthetic::ShotScript;
use golfshot_rs::{
    GolfConfig, JsonLinesSink, OutputLayout, ReplayEngine, ShotEvent, ShotSession, ShotState,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Layout {
    /// [1, 4+K, N]
    BoxMajor,
    /// [1, N, 4+K]
    DetectionMajor,
}

impl From<Layout> for OutputLayout {
    fn from(layout: Layout) -> Self {
        match layout {
            Layout::BoxMajor => OutputLayout::BoxMajor,
            Layout::DetectionMajor => OutputLayout::DetectionMajor,
        }
    }
}

/// 高尔夫击球追踪演示
#[derive(Parser, Debug)]
#[command(author, version, about = "高尔夫击球追踪 - 合成挥杆回放", long_about = None)]
struct Args {
    /// JSON配置文件 (不存在时写入默认值)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 模型输出布局
    #[arg(short, long, value_enum, default_value_t = Layout::BoxMajor)]
    layout: Layout,

    /// 采集帧率
    #[arg(long, default_value_t = 240.0)]
    fps: f32,

    /// 抽帧: 每N帧处理一帧
    #[arg(long, default_value_t = 2)]
    skip: u32,

    /// 最多回放的采集帧数
    #[arg(long, default_value_t = 240)]
    frames: u64,

    /// 检测抖动幅度 (像素)
    #[arg(long, default_value_t = 0.0)]
    jitter: f32,

    /// 随机种子
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// 模拟推理耗时 (毫秒)
    #[arg(long, default_value_t = 0)]
    latency_ms: u64,

    /// 击球记录输出 (JSON lines,追加写入)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GolfConfig::load(path),
        None => GolfConfig::default(),
    };
    let script = ShotScript {
        capture_fps: args.fps,
        frame_skip: args.skip.max(1),
        jitter: args.jitter,
        ..ShotScript::default()
    };
    config.pipeline.frame_skip = script.frame_skip;
    config.calibration = script.calibration();
    config.validate()?;
    config.print_summary();

    // 预先生成被处理帧的原始输出
    let num_classes = config.decoder.num_classes.unwrap_or(2);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let outputs = script.outputs(
        args.frames,
        args.layout.into(),
        num_classes,
        config.decoder.input_size,
        Some(&mut rng),
    );
    info!("📼 {:?} 布局, {} 个回放输出", args.layout, outputs.len());

    let mut engine = ReplayEngine::new(outputs, num_classes);
    if args.latency_ms > 0 {
        engine = engine.with_latency(Duration::from_millis(args.latency_ms));
    }

    let mut session = ShotSession::new(config);
    if let Some(path) = &args.output {
        session = session.with_sink(Box::new(JsonLinesSink::create(path)?));
        info!("💾 击球记录输出到 {}", path.display());
    }
    session.initialize(Box::new(engine))?;
    session.start_tracking();

    let wait = Duration::from_secs(5);
    for t in 0..args.frames {
        let (_, events) = session.submit_and_wait(script.frame(t), wait)?;
        for event in &events {
            match event {
                ShotEvent::TrackingComplete(record) => {
                    println!("{}", serde_json::to_string_pretty(record.as_ref())?);
                }
                other => info!("📣 {:?}", other),
            }
        }
        if matches!(
            session.controller().state(),
            ShotState::Complete | ShotState::Idle
        ) {
            break;
        }
    }

    if session.completed_shots().is_empty() {
        warn!("⚠️ 回放结束仍未完成击球 (状态 {:?})", session.controller().state());
    }

    let health = session.health();
    info!(
        "📊 发送 {} | 处理 {} | 丢弃 {} ({:.0}%) | 故障 {}",
        health.frames_sent,
        health.frames_processed,
        health.frames_dropped,
        health.drop_rate() * 100.0,
        health.worker_faults
    );
    session.dispose();
    Ok(())
}
