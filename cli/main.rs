#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::PathBuf;
use std::process;

use trendwise::matrix::{BuildProgress, RiskMatrix};
use trendwise::model::TrainedModel;
use trendwise::pipeline::{ModelStatus, PipelineOutcome};
use trendwise::reconcile::{reconcile, write_csv};
use trendwise::summary::{
    RecommendationFilter, counts_by_category, ingredient_risk_ranking, label_counts,
    recommendations_for, trend_high_risk_share,
};
use trendwise::types::TrendCategory;
use trendwise::{AssessConfig, Dataset, RiskLabel, RiskPipeline};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "trendwise",
    about = "Personalized health-risk assessment for trending skincare and dietary products",
    long_about = "Scores every user against every trending product with an explainable rule \
                 engine, trains a classifier on the labelled pairs and reports both side by side."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Inputs shared by every command.
#[derive(Args)]
struct DataArgs {
    /// Directory holding Users.csv, trends.csv and ingredient_risk.csv
    #[arg(long, value_name = "DIR")]
    data_dir: PathBuf,

    /// Optional TOML configuration; defaults apply to anything it omits
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

impl DataArgs {
    fn load(&self) -> Result<(Dataset, AssessConfig), Box<dyn Error>> {
        let config = match &self.config {
            Some(path) => AssessConfig::load(path)?,
            None => AssessConfig::default(),
        };
        let dataset = Dataset::load(&self.data_dir)?;
        Ok((dataset, config))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rule engine on a single (user, trend) pair
    Assess {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long)]
        user: String,
        #[arg(long)]
        trend: String,
    },
    /// Build the labelled risk matrix and write it as TSV
    Matrix {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
    /// Train the risk model and save it as TOML
    Train {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long, value_name = "FILE")]
        model: PathBuf,
    },
    /// Reconcile rule labels with model predictions for every pair
    Predict {
        #[command(flatten)]
        data: DataArgs,
        /// Use a saved model instead of training on the current data
        #[arg(long, value_name = "FILE")]
        model: Option<PathBuf>,
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
    /// Summarise risk for one user and across the data set
    Report {
        #[command(flatten)]
        data: DataArgs,
        #[arg(long)]
        user: String,
        #[arg(long, value_parser = parse_category)]
        category: Option<TrendCategory>,
        #[arg(long, value_parser = parse_label)]
        label: Option<RiskLabel>,
    },
}

fn parse_category(text: &str) -> Result<TrendCategory, String> {
    match TrendCategory::parse(text) {
        TrendCategory::General if !text.trim().eq_ignore_ascii_case("general") => Err(format!(
            "unknown category '{text}' (expected skincare, diet, supplement or general)"
        )),
        category => Ok(category),
    }
}

fn parse_label(text: &str) -> Result<RiskLabel, String> {
    RiskLabel::parse(text)
        .ok_or_else(|| format!("unknown risk label '{text}' (expected safe, medium or high)"))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Assess { data, user, trend }) => run_assess(data, user, trend),
        Some(Commands::Matrix { data, out }) => run_matrix(data, out),
        Some(Commands::Train { data, model }) => run_train(data, model),
        Some(Commands::Predict { data, model, out }) => run_predict(data, model, out),
        Some(Commands::Report {
            data,
            user,
            category,
            label,
        }) => run_report(data, user, RecommendationFilter { category, label }),
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

// ========================================================================================
//                                       Progress
// ========================================================================================

struct MatrixProgress {
    bar: ProgressBar,
}

impl MatrixProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pairs ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message("assessing");
        Self { bar }
    }
}

impl BuildProgress for MatrixProgress {
    fn on_start(&self, total_pairs: usize) {
        self.bar.set_length(total_pairs as u64);
    }

    fn on_pair(&self) {
        self.bar.inc(1);
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}

// ========================================================================================
//                                       Commands
// ========================================================================================

fn run_assess(data: DataArgs, user: String, trend: String) -> CliResult {
    let (dataset, config) = data.load()?;
    let pipeline = RiskPipeline::new(config);
    let assessment = pipeline.assess_pair(&dataset, &user, &trend)?;

    println!(
        "{} x {}: {} (score {:.2})",
        assessment.user_id, assessment.trend_id, assessment.label, assessment.score
    );
    for reason in &assessment.reasons {
        println!("  - {reason}");
    }
    Ok(())
}

fn build_matrix(dataset: &Dataset, config: &AssessConfig) -> RiskMatrix {
    RiskMatrix::build_with_progress(
        &dataset.users,
        &dataset.trends,
        &dataset.risk_table,
        &config.rules,
        &MatrixProgress::new(),
    )
}

fn print_build_report(matrix: &RiskMatrix) {
    for issue in &matrix.report.integrity {
        eprintln!("warning: {issue}");
    }
    for failure in &matrix.report.failures {
        eprintln!(
            "warning: pair ({}, {}) has no feature row: {}",
            failure.user_id, failure.trend_id, failure.error
        );
    }
}

fn run_matrix(data: DataArgs, out: PathBuf) -> CliResult {
    let (dataset, config) = data.load()?;
    let matrix = build_matrix(&dataset, &config);
    print_build_report(&matrix);

    matrix.write_tsv(BufWriter::new(File::create(&out)?))?;
    let counts = label_counts(&matrix.assessments);
    println!(
        "Wrote {} rows to '{}' (Safe {}, Medium {}, High {}).",
        matrix.len(),
        out.display(),
        counts.safe,
        counts.medium,
        counts.high
    );
    Ok(())
}

fn run_pipeline(data: &DataArgs) -> Result<(Dataset, std::sync::Arc<PipelineOutcome>), Box<dyn Error>> {
    let (dataset, config) = data.load()?;
    let mut pipeline = RiskPipeline::new(config);
    let outcome = pipeline.run_with_progress(&dataset, &MatrixProgress::new());
    print_build_report(&outcome.matrix);
    Ok((dataset, outcome))
}

fn run_train(data: DataArgs, model_path: PathBuf) -> CliResult {
    let (_, outcome) = run_pipeline(&data)?;
    let model = match &outcome.model {
        ModelStatus::Trained(model) => model,
        ModelStatus::Previous { reason, .. } | ModelStatus::RuleOnly { reason } => {
            return Err(reason.clone().into());
        }
    };

    model.save(&model_path)?;
    let metrics = &model.metrics;
    println!(
        "Model saved to '{}'. {} accuracy {:.3} over {} rows ({} training rows, {} iterations).",
        model_path.display(),
        if metrics.evaluated_on_training {
            "Training"
        } else {
            "Holdout"
        },
        metrics.accuracy,
        if metrics.evaluated_on_training {
            metrics.train_size
        } else {
            metrics.holdout_size
        },
        metrics.train_size,
        metrics.iterations
    );
    for class in &metrics.per_class {
        println!(
            "  {:<6} precision {:.3}  recall {:.3}  support {}",
            class.label, class.precision, class.recall, class.support
        );
    }
    Ok(())
}

fn run_predict(data: DataArgs, model_path: Option<PathBuf>, out: PathBuf) -> CliResult {
    let records = match model_path {
        Some(path) => {
            let model = TrainedModel::load(&path)?;
            let (dataset, config) = data.load()?;
            let matrix = build_matrix(&dataset, &config);
            print_build_report(&matrix);
            reconcile(&dataset, &matrix, Some(&model))
        }
        None => {
            let (_, outcome) = run_pipeline(&data)?;
            if let Some(reason) = outcome.model.reason() {
                eprintln!("warning: {reason}");
            }
            outcome.records.clone()
        }
    };

    write_csv(&records, BufWriter::new(File::create(&out)?))?;
    let disagreements = records.iter().filter(|r| r.disagrees()).count();
    println!(
        "Wrote {} records to '{}'; model and rules disagree on {disagreements}.",
        records.len(),
        out.display()
    );
    Ok(())
}

fn run_report(data: DataArgs, user: String, filter: RecommendationFilter) -> CliResult {
    let (dataset, outcome) = run_pipeline(&data)?;
    if let Some(reason) = outcome.model.reason() {
        eprintln!("warning: {reason}");
    }
    let assessments = outcome.assessments();

    let recommendations = recommendations_for(&dataset, &outcome.records, &user, filter)?;
    println!("Trends for {user} (riskiest first):");
    for item in &recommendations {
        let model_view = match (item.predicted_label, item.confidence) {
            (Some(label), Some(confidence)) => format!("model: {label} ({confidence:.2})"),
            _ => "model: n/a".to_string(),
        };
        println!(
            "  {:<24} {:<10} {:<6} score {:>5.2}  {model_view}",
            item.trend_id, item.category, item.label, item.score
        );
        for reason in &item.reasons {
            println!("      - {reason}");
        }
    }

    let counts = label_counts(assessments);
    println!(
        "\nAll pairs: Safe {}, Medium {}, High {}",
        counts.safe, counts.medium, counts.high
    );
    for (category, counts) in counts_by_category(&dataset, assessments) {
        println!(
            "  {:<10} Safe {:>4}  Medium {:>4}  High {:>4}",
            category, counts.safe, counts.medium, counts.high
        );
    }

    println!("\nShare of users at high risk per trend:");
    for share in trend_high_risk_share(&dataset, assessments) {
        println!("  {:<24} {:>5.1}%", share.trend_id, share.share * 100.0);
    }

    println!("\nRiskiest ingredients:");
    for ingredient in ingredient_risk_ranking(&dataset, assessments, 10) {
        println!(
            "  {:<24} mean score {:.2} across {} trend(s)",
            ingredient.ingredient, ingredient.mean_score, ingredient.trend_count
        );
    }
    Ok(())
}
