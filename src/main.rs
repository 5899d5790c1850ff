use anyhow::{Context, Result};
use apkres::core::config::{parse_settings, Settings, SETTINGS_FILE};
use apkres::core::framework::{FrameworkCache, FrameworkStore};
use apkres::core::packager::pipeline::{DecodedApk, Pipeline, PipelineOptions};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Settings file
    #[clap(long, default_value = SETTINGS_FILE)]
    config: PathBuf,
    #[clap(flatten)]
    framework: FrameworkArgs,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(ClapArgs)]
struct FrameworkArgs {
    /// Directory holding installed framework tables
    #[clap(long, global = true)]
    frame_path: Option<PathBuf>,
    /// Prefer frameworks installed with this tag
    #[clap(long, short, global = true)]
    tag: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let settings = parse_settings(&args.config);
    args.command.run(&settings, &args.framework)
}

#[derive(Subcommand)]
enum Commands {
    /// Decode an APK into an editable directory
    Decode {
        apk: PathBuf,
        #[clap(long, short)]
        output: Option<PathBuf>,
        /// Replace the output directory if it exists
        #[clap(long, short)]
        force: bool,
        /// Fail on the first warning
        #[clap(long)]
        strict: bool,
    },
    /// Rebuild an APK from a decoded directory
    Build {
        dir: PathBuf,
        #[clap(long, short)]
        output: Option<PathBuf>,
        /// Re-encode every string pool as UTF-8
        #[clap(long)]
        force_utf8: bool,
    },
    /// Install the resource table of a framework APK
    InstallFramework { apk: PathBuf },
    /// List installed frameworks
    ListFrameworks,
    /// Remove installed frameworks, only those with `--tag` if given
    CleanFrameworks,
}

impl FrameworkArgs {
    fn cache(&self, settings: &Settings) -> FrameworkCache {
        let dir = self
            .frame_path
            .clone()
            .or_else(|| settings.framework.dir.clone())
            .unwrap_or_else(FrameworkStore::default_dir);
        let tag = self.tag.clone().or_else(|| settings.framework.tag.clone());
        FrameworkCache::new(FrameworkStore::new(dir), tag)
    }
}

fn default_output(input: &Path, extension: Option<&str>) -> PathBuf {
    let stem = input.file_stem().unwrap_or(input.as_os_str());
    let mut output = PathBuf::from(stem);
    if let Some(extension) = extension {
        output.set_extension(extension);
    }
    output
}

impl Commands {
    pub fn run(self, settings: &Settings, framework: &FrameworkArgs) -> Result<()> {
        let frameworks = framework.cache(settings);
        let mut options = PipelineOptions::from(settings);
        match self {
            Self::Decode {
                apk,
                output,
                force,
                strict,
            } => {
                options.strict |= strict;
                let output = output.unwrap_or_else(|| default_output(&apk, None));
                if force && output.exists() {
                    std::fs::remove_dir_all(&output)
                        .with_context(|| format!("Removing `{}`", output.display()))?;
                }
                let mut pipeline = Pipeline::new(&frameworks, options);
                let decoded = pipeline
                    .decode_to(&apk, &output)
                    .with_context(|| format!("Decoding `{}`", apk.display()))?;
                let warnings = pipeline.diagnostics().len();
                if warnings > 0 {
                    log::warn!("{} warnings while decoding", warnings);
                }
                if !decoded.info.uses_framework.ids.is_empty() {
                    log::info!("Uses frameworks: {:?}", decoded.info.uses_framework.ids);
                }
            }
            Self::Build {
                dir,
                output,
                force_utf8,
            } => {
                options.force_utf8 |= force_utf8;
                let output = output.unwrap_or_else(|| default_output(&dir, Some("apk")));
                let mut pipeline = Pipeline::new(&frameworks, options);
                let decoded: DecodedApk = pipeline
                    .load(&dir)
                    .with_context(|| format!("Reading `{}`", dir.display()))?;
                pipeline
                    .encode_to(&decoded, &output)
                    .with_context(|| format!("Building `{}`", output.display()))?;
            }
            Self::InstallFramework { apk } => {
                let installed = frameworks
                    .install(&apk)
                    .with_context(|| format!("Installing `{}`", apk.display()))?;
                for framework in installed {
                    println!("{}", framework.path.display());
                }
            }
            Self::ListFrameworks => {
                for framework in frameworks.store().list()? {
                    match framework.tag {
                        Some(tag) => println!("{}\t{}\t{}", framework.id, tag, framework.path.display()),
                        None => println!("{}\t-\t{}", framework.id, framework.path.display()),
                    }
                }
            }
            Self::CleanFrameworks => {
                let removed = frameworks.store().clean(frameworks.tag())?;
                log::info!("Removed {} frameworks", removed);
            }
        }
        Ok(())
    }
}
