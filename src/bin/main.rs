use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use hdr_save::{FloatImage, ImageMetadata, SavePipeline, SaveResults, SaveSettings};
use hdr_save::pipeline::BatchNumbering;

#[derive(Parser)]
#[clap(name = "hdr_save", about = "Save images as 16-bit PNG or EXR with sequential filenames")]
struct Cli {
    /// Settings file, flags below override its values
    #[clap(short, long)]
    config: Option<PathBuf>,

    #[clap(short, long)]
    output_dir: Option<PathBuf>,

    /// Filename prefix, may contain sub/folders, %width%, %height% and %batch_num%
    #[clap(short, long)]
    prefix: Option<String>,

    /// png16 | png8 | exr
    #[clap(short, long)]
    format: Option<String>,

    /// JSON file embedded as the `prompt` text
    #[clap(long)]
    prompt: Option<PathBuf>,

    /// JSON object whose entries are embedded as separate texts
    #[clap(long)]
    extra_pnginfo: Option<PathBuf>,

    /// Number every image of the batch above the previous one
    #[clap(long)]
    sequential: bool,

    /// Create each file exclusively before writing it
    #[clap(long)]
    reserve: bool,

    #[clap(long)]
    no_metadata: bool,

    /// Images making up the batch
    #[clap(required = true)]
    inputs: Vec<PathBuf>,
}

fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    let settings = load_settings(&cli)?;
    let metadata = load_metadata(&cli)?;

    let time = Instant::now();
    let images = cli
        .inputs
        .iter()
        .map(|path| load_image(path))
        .collect::<Result<Vec<_>>>()?;
    info!("{:<14}{:>6} ms ({} images)", "Loading", time.elapsed().as_millis(), images.len());

    let pipeline = SavePipeline::from_settings(&settings).context("Failed to set up save pipeline")?;

    let mut results = SaveResults::default();
    pipeline
        .save_batch(&images, &settings.filename_prefix, Some(&metadata), &mut results)
        .context("Failed to save batch")?;

    println!("{}", serde_json::to_string_pretty(&results.to_ui())?);

    Ok(())
}

/// Settings file (or defaults) with the command line flags applied on top.
fn load_settings(cli: &Cli) -> Result<SaveSettings> {
    let mut settings = match &cli.config {
        Some(path) => SaveSettings::from_file(path).with_context(|| format!("Failed to read settings from {}", path.display()))?,
        None => SaveSettings::default(),
    };

    if let Some(output_dir) = &cli.output_dir {
        settings.output_directory = output_dir.clone();
    }
    if let Some(prefix) = &cli.prefix {
        settings.filename_prefix = prefix.clone();
    }
    if let Some(format) = &cli.format {
        settings.format = format.parse().map_err(|e: String| anyhow!(e))?;
    }
    if cli.sequential {
        settings.batch_numbering = BatchNumbering::Sequential;
    }
    if cli.reserve {
        settings.reserve = true;
    }
    if cli.no_metadata {
        settings.embed_metadata = false;
    }

    Ok(settings)
}

fn load_metadata(cli: &Cli) -> Result<ImageMetadata> {
    Ok(ImageMetadata {
        prompt: cli.prompt.as_deref().map(read_json).transpose()?,
        extra_pnginfo: match cli.extra_pnginfo.as_deref().map(read_json).transpose()? {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(anyhow!("--extra-pnginfo must be a JSON object")),
            None => Map::new(),
        },
    })
}

fn load_image(path: &Path) -> Result<FloatImage> {
    let decoded = image::open(path).with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok(FloatImage::from_dynamic(&decoded)?)
}

fn read_json(path: &Path) -> Result<Value> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries the result JSON
    let console_appender = fmt::layer().with_writer(std::io::stderr).with_target(false);

    tracing_subscriber::registry()
        .with(console_appender.with_filter(filter))
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
