use clap::{Parser, Subcommand, ValueEnum};
use std::{path::PathBuf, process};
use tracing::Level;
use track_converter_core::{
    paths, probe_track, set_convert_progress_callback, BatchRequest, CancelToken, ConvertProgress,
    Converter, ConverterConfig, ConverterSettings, DecoderRegistry, DspPresetChain, DspRegistry,
    EncoderPreset, InvocationMethod, OutputFormat, PcmFormat, PresetStore, SupportedFormats,
    TrackOutcome,
};

#[derive(Parser)]
#[command(name = "track-converter")]
#[command(about = "Convert audio tracks through DSP presets into external encoders", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert files with an encoder preset
    Convert {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Encoder preset title (defaults to the last used one)
        #[arg(short, long)]
        encoder: Option<String>,

        /// DSP preset title
        #[arg(short, long)]
        dsp: Option<String>,

        /// keep, 8, 16, 24, 32 or float
        #[arg(short, long)]
        format: Option<OutputFormat>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long)]
        jobs: Option<usize>,

        /// Refuse formats the encoder preset does not list
        #[arg(long)]
        strict: bool,

        #[arg(short, long)]
        quiet: bool,
    },

    /// List encoder and DSP presets
    Presets,

    /// List decoders and DSP plugins
    Plugins,

    AddEncoder {
        #[arg(long)]
        title: String,

        /// Output file name template, e.g. "%a - %t.mp3"
        #[arg(long)]
        fname: String,

        /// Command line; %s is the output file
        #[arg(long)]
        encoder: String,

        #[arg(long, value_enum, default_value = "pipe")]
        method: MethodArg,

        /// Accepted formats, comma separated (8,16,24,32,float); all if omitted
        #[arg(long, value_delimiter = ',')]
        formats: Vec<OutputFormat>,

        #[arg(long)]
        overwrite: bool,
    },

    RemoveEncoder {
        title: String,
    },

    AddDsp {
        #[arg(long)]
        title: String,

        /// Stage as `id` or `id:p0,p1,...`; repeat in chain order
        #[arg(long = "stage")]
        stages: Vec<String>,

        #[arg(long)]
        overwrite: bool,
    },

    RemoveDsp {
        title: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MethodArg {
    Pipe,
    TempFile,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Convert {
            inputs,
            encoder,
            dsp,
            format,
            output,
            jobs,
            strict,
            quiet,
        } => handle_convert(inputs, encoder, dsp, format, output, jobs, strict, quiet),
        Commands::Presets => handle_presets(),
        Commands::Plugins => handle_plugins(),
        Commands::AddEncoder {
            title,
            fname,
            encoder,
            method,
            formats,
            overwrite,
        } => handle_add_encoder(title, fname, encoder, method, formats, overwrite),
        Commands::RemoveEncoder { title } => handle_remove_encoder(title),
        Commands::AddDsp {
            title,
            stages,
            overwrite,
        } => handle_add_dsp(title, stages, overwrite),
        Commands::RemoveDsp { title } => handle_remove_dsp(title),
    };

    match result {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn load_store() -> Result<PresetStore, Box<dyn std::error::Error>> {
    Ok(PresetStore::load_default(DspRegistry::with_defaults())?)
}

#[allow(clippy::too_many_arguments)]
fn handle_convert(
    inputs: Vec<PathBuf>,
    encoder: Option<String>,
    dsp: Option<String>,
    format: Option<OutputFormat>,
    output: Option<PathBuf>,
    jobs: Option<usize>,
    strict: bool,
    quiet: bool,
) -> CliResult {
    let store = load_store()?;
    let settings_path = paths::settings_path()?;
    let mut settings = ConverterSettings::load(&settings_path);

    let encoder_idx = match encoder {
        Some(title) => store
            .find_encoder(&title)
            .ok_or_else(|| format!("No encoder preset named `{}`", title))?,
        None if settings.encoder_preset < store.encoders().len() => settings.encoder_preset,
        None => return Err("No encoder preset selected; add one with `add-encoder`".into()),
    };
    let dsp_idx = match dsp {
        Some(title) => store
            .find_dsp(&title)
            .ok_or_else(|| format!("No DSP preset named `{}`", title))?,
        None if settings.dsp_preset < store.dsp_presets().len() => settings.dsp_preset,
        None => 0,
    };
    let output_format = format.unwrap_or(settings.output_format);
    let output_dir = match output {
        Some(dir) => dir,
        None if !settings.output_folder.is_empty() => PathBuf::from(&settings.output_folder),
        None => std::env::current_dir()?,
    };

    let decoders = DecoderRegistry::with_defaults();
    let mut tracks = Vec::with_capacity(inputs.len());
    for input in &inputs {
        match probe_track(input, &decoders) {
            Ok(t) => tracks.push(t),
            Err(e) => eprintln!("Skipping {}: {}", input.display(), e),
        }
    }

    let mut config = ConverterConfig::default();
    if let Some(j) = jobs {
        config.jobs = j.max(1);
    }
    config.strict_formats = strict;

    let req = BatchRequest::new(store.encoder_snapshot(encoder_idx)?, &output_dir)
        .with_dsp(store.dsp_snapshot(dsp_idx)?)
        .with_format(output_format);

    if !quiet {
        eprintln!("Encoder: {}", req.encoder.title);
        eprintln!("DSP:     {}", store.dsp_presets()[dsp_idx].title);
        eprintln!("Format:  {}", output_format);
        eprintln!("Output:  {}", output_dir.display());
        eprintln!();
        setup_progress_callback();
    }

    let converter = Converter::new(decoders, config);
    let report = converter.convert_batch(&tracks, &req, &CancelToken::new())?;

    settings.encoder_preset = encoder_idx;
    settings.dsp_preset = dsp_idx;
    settings.output_format = output_format;
    settings.output_folder = output_dir.to_string_lossy().into_owned();
    settings.save(&settings_path)?;

    for t in &report.tracks {
        match &t.outcome {
            TrackOutcome::Converted { output_path, .. } => {
                if quiet {
                    println!("{}", output_path.display());
                }
            }
            TrackOutcome::Skipped { reason, .. } => {
                eprintln!("Failed: {}: {}", t.path.display(), reason);
            }
            TrackOutcome::Cancelled => {}
        }
    }

    if report.converted() < inputs.len() {
        return Err(format!("{} of {} files converted", report.converted(), inputs.len()).into());
    }
    Ok(())
}

fn handle_presets() -> CliResult {
    let store = load_store()?;

    eprintln!("Encoder presets ({})", store.encoders_dir().display());
    for (i, p) in store.encoders().iter().enumerate() {
        let method = match p.method {
            InvocationMethod::Pipe => "pipe",
            InvocationMethod::TempFile => "temp file",
        };
        eprintln!("  {:>2}. {} [{}] {}", i, p.title, method, p.encoder);
    }
    eprintln!();
    eprintln!("DSP presets ({})", store.dsp_dir().display());
    for (i, c) in store.dsp_presets().iter().enumerate() {
        let stages: Vec<&str> = c.stages().iter().map(|s| s.id()).collect();
        eprintln!("  {:>2}. {} [{}]", i, c.title, stages.join(" -> "));
    }
    Ok(())
}

fn handle_plugins() -> CliResult {
    eprintln!("Decoders");
    for id in DecoderRegistry::with_defaults().ids() {
        eprintln!("  • {}", id);
    }
    eprintln!();
    eprintln!("DSP plugins");
    for p in DspRegistry::with_defaults().plugins() {
        let params: Vec<String> = (0..p.num_params())
            .map(|i| format!("{}={}", p.param_name(i), p.default_param(i)))
            .collect();
        eprintln!("  • {} ({}) {}", p.id(), p.name(), params.join(" "));
    }
    Ok(())
}

fn handle_add_encoder(
    title: String,
    fname: String,
    encoder: String,
    method: MethodArg,
    formats: Vec<OutputFormat>,
    overwrite: bool,
) -> CliResult {
    let mut store = load_store()?;

    let formats = if formats.is_empty() {
        SupportedFormats::ALL
    } else {
        let mut set = SupportedFormats::default();
        for f in &formats {
            if *f == OutputFormat::KeepSource {
                return Err("`keep` is not a sample format".into());
            }
            set.insert(&f.negotiate(&PcmFormat::int(44100, 2, 16)));
        }
        set
    };
    let method = match method {
        MethodArg::Pipe => InvocationMethod::Pipe,
        MethodArg::TempFile => InvocationMethod::TempFile,
    };

    let preset = EncoderPreset {
        title,
        fname,
        encoder,
        method,
        formats,
    };
    let idx = store.add_encoder(preset, overwrite)?;
    eprintln!("Saved encoder preset #{}", idx);
    Ok(())
}

fn handle_remove_encoder(title: String) -> CliResult {
    let mut store = load_store()?;
    let idx = store
        .find_encoder(&title)
        .ok_or_else(|| format!("No encoder preset named `{}`", title))?;
    store.remove_encoder(idx)?;
    eprintln!("Removed encoder preset `{}`", title);
    Ok(())
}

fn handle_add_dsp(title: String, stages: Vec<String>, overwrite: bool) -> CliResult {
    let mut store = load_store()?;

    let mut chain = DspPresetChain::new(title);
    for stage in &stages {
        let (id, params) = match stage.split_once(':') {
            Some((id, params)) => (id, Some(params)),
            None => (stage.as_str(), None),
        };
        let plugin = store.registry().require(id)?;
        let idx = chain.add_stage(plugin);
        if let Some(params) = params {
            for (i, v) in params.split(',').enumerate() {
                let value: f32 = v
                    .trim()
                    .parse()
                    .map_err(|_| format!("Bad parameter `{}` for `{}`", v, id))?;
                chain.set_param(idx, i, value)?;
            }
        }
    }

    let idx = store.add_dsp(chain, overwrite)?;
    eprintln!("Saved DSP preset #{}", idx);
    Ok(())
}

fn handle_remove_dsp(title: String) -> CliResult {
    let mut store = load_store()?;
    let idx = store
        .find_dsp(&title)
        .ok_or_else(|| format!("No DSP preset named `{}`", title))?;
    store.remove_dsp(idx)?;
    eprintln!("Removed DSP preset `{}`", title);
    Ok(())
}

fn setup_progress_callback() {
    set_convert_progress_callback(|progress| match progress {
        ConvertProgress::TrackStarted { index, total, path } => {
            eprintln!("[{}/{}] {}", index + 1, total, path.display());
        }
        ConvertProgress::BlockWritten { bytes, .. } => {
            eprint!("\r  {:.2} MB", bytes as f64 / 1_000_000.0);
        }
        ConvertProgress::TrackFinished { converted, .. } => {
            eprintln!("{}", if converted { "\r  done" } else { "\r  failed" });
        }
        ConvertProgress::Finished { converted, total } => {
            eprintln!();
            eprintln!("Converted {}/{} tracks", converted, total);
        }
    });
}
