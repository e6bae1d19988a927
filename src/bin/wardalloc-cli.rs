#![forbid(unsafe_code)]
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "logging")]
use tracing_subscriber::{fmt::Subscriber, EnvFilter};
use wardalloc::{
    io,
    model::{Roster, ScheduleDate, SlotSet, StaffId, Team},
    storage::JsonStorage,
    workflow::{SaveReport, SystemClock, WorkflowController},
    CacheService,
};

/// CLI d'allocation quotidienne du service (sans base de données)
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Active les logs (feature `logging`)
    #[arg(long, global = true)]
    log: bool,

    /// Fichier JSON de configuration (personnel, programmes, lits)
    #[arg(long, global = true, default_value = "roster.json")]
    roster: String,

    /// Répertoire des plannings sauvegardés (un fichier par date)
    #[arg(long, global = true, default_value = "schedules")]
    store: String,

    /// Date de planning YYYY-MM-DD (défaut : aujourd'hui, heure locale)
    #[arg(long, global = true)]
    date: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Importer du personnel depuis un CSV dans le roster
    ImportStaff {
        #[arg(long)]
        csv: String,
    },

    /// Importer les congés/FTE du jour depuis un CSV
    ImportLeave {
        #[arg(long)]
        csv: String,
    },

    /// Saisir le congé/FTE d'une personne
    SetLeave {
        #[arg(long)]
        staff: String,
        /// Type de congé brut ("AL", "sick", vide = en service)
        #[arg(long)]
        leave: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        fte: f64,
        /// Créneaux disponibles "1,2,4" (défaut : journée complète)
        #[arg(long)]
        slots: Option<String>,
    },

    /// Modifier le nombre de lits d'une équipe (toujours éditable)
    SetBeds {
        #[arg(long)]
        team: String,
        #[arg(long)]
        beds: u32,
    },

    /// Afficher l'étape courante et les problèmes en attente
    Status,

    /// Afficher les allocations et optionnellement exporter
    Compute {
        #[arg(long)]
        out_json: Option<String>,
        #[arg(long)]
        out_csv: Option<String>,
    },

    /// Valider l'étape courante et passer à la suivante (sauvegarde dans tous les cas)
    Advance,

    /// Revenir à l'étape précédente
    Back,

    /// Trancher une égalité en attente
    ResolveTie {
        #[arg(long, default_value_t = 0)]
        index: usize,
        #[arg(long)]
        team: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Exporter la grille PCA et les transferts de lits
    Export {
        #[arg(long)]
        out_csv: String,
        #[arg(long)]
        beds_csv: Option<String>,
    },
}

fn load_roster(path: &str) -> Result<Roster> {
    if Path::new(path).exists() {
        io::load_roster_json(path)
    } else {
        Ok(Roster::default())
    }
}

fn resolve_staff(roster: &Roster, key: &str) -> Result<StaffId> {
    roster
        .find_staff(&StaffId::new(key))
        .or_else(|| roster.find_staff_by_name(key))
        .map(|s| s.id.clone())
        .ok_or_else(|| anyhow!("unknown staff: {key}"))
}

fn persist(ctl: &mut WorkflowController<JsonStorage>) -> Result<()> {
    match ctl.save() {
        SaveReport::Saved { .. } | SaveReport::Queued => Ok(()),
        SaveReport::Failed(msg) => bail!("save failed: {msg}"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    #[cfg(feature = "logging")]
    if cli.log {
        let _ = Subscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    }

    let date = match &cli.date {
        Some(raw) => raw.parse::<ScheduleDate>()?,
        None => ScheduleDate::today_local(),
    };
    let roster = load_roster(&cli.roster)?;

    if let Commands::ImportStaff { csv } = &cli.cmd {
        let mut roster = roster;
        let staff = io::import_staff_csv(csv)?;
        let count = staff.len();
        for s in staff {
            roster.staff.retain(|existing| existing.id != s.id);
            roster.staff.push(s);
        }
        io::save_roster_json(&cli.roster, &roster)?;
        println!("Imported {count} staff into {}", cli.roster);
        return Ok(());
    }

    let storage = JsonStorage::open(&cli.store)?;
    let mut ctl = WorkflowController::open(
        storage,
        Arc::new(roster),
        date,
        CacheService::disabled(),
        Box::new(SystemClock),
    )?;

    let code = match cli.cmd {
        Commands::ImportStaff { .. } => 0,
        Commands::ImportLeave { csv } => {
            let rows = io::import_day_status_csv(csv)?;
            let count = rows.len();
            for (id, status) in rows {
                ctl.set_staff_status(&id, status)
                    .with_context(|| format!("applying day status for {id}"))?;
            }
            persist(&mut ctl)?;
            println!("Applied {count} day status row(s) for {date}");
            0
        }
        Commands::SetLeave {
            staff,
            leave,
            fte,
            slots,
        } => {
            let id = resolve_staff(ctl.state().roster(), &staff)?;
            let slots = slots.as_deref().map(SlotSet::parse_list).transpose()?;
            ctl.set_staff_status_raw(&id, leave.as_deref(), fte, slots)?;
            persist(&mut ctl)?;
            0
        }
        Commands::SetBeds { team, beds } => {
            let team: Team = team.parse()?;
            ctl.set_ward_beds(team, beds);
            persist(&mut ctl)?;
            0
        }
        Commands::Status => {
            println!("{date} | step {}", ctl.step());
            if let Some(err) = ctl.state().compute_error() {
                println!("compute error: {err}");
            }
            for (i, tie) in ctl.pending_ties().iter().enumerate() {
                let teams: Vec<&str> = tie.context.tied_teams.iter().map(Team::as_str).collect();
                println!(
                    "tie #{i}: {} for PCA {} slot {}",
                    teams.join("/"),
                    tie.context.candidate,
                    tie.context.slot
                );
            }
            let validation = ctl.validate(ctl.step());
            for issue in &validation.issues {
                println!("{:?} {:?}: {}", issue.severity, issue.code, issue.message);
            }
            if validation.passed() {
                0
            } else {
                2
            }
        }
        Commands::Compute { out_json, out_csv } => {
            let calcs = ctl
                .calculations()
                .ok_or_else(|| anyhow!("no allocation: {}", ctl.state().compute_error().unwrap_or("unknown error")))?;
            if let Some(path) = out_json {
                io::export_calculations_json(path, &calcs)?;
            }
            if let Some(path) = out_csv {
                io::export_pca_csv(path, &calcs, ctl.state().roster())?;
            }
            println!("beds per PT: {:.2}", calcs.beds_fte.beds_per_pt);
            for (team, counters) in &calcs.tracker.teams {
                if counters.target == 0 && counters.received() == 0 {
                    continue;
                }
                println!(
                    "{team} | relief {:+} | PCA {:.2}/{:.2}{}",
                    calcs.beds.relieving.get(team).copied().unwrap_or(0),
                    f64::from(counters.received()) / 4.0,
                    f64::from(counters.target) / 4.0,
                    if counters.pending_tie { " (tie pending)" } else { "" }
                );
            }
            for t in &calcs.beds.transfers {
                println!("{} → {} : {} bed(s)", t.source, t.target, t.beds);
            }
            if calcs.pending_ties.is_empty() {
                0
            } else {
                2
            }
        }
        Commands::Advance => {
            let transition = ctl.advance();
            for issue in &transition.validation.issues {
                eprintln!("{:?} {:?}: {}", issue.severity, issue.code, issue.message);
            }
            if let SaveReport::Failed(msg) = &transition.save {
                bail!("save failed: {msg}");
            }
            match transition.to {
                Some(next) => {
                    println!("{} → {next}", transition.from);
                    0
                }
                None => {
                    eprintln!("blocked at {}", transition.from);
                    // Code 2 = étape bloquée
                    2
                }
            }
        }
        Commands::Back => {
            let prev = ctl.go_back()?;
            persist(&mut ctl)?;
            println!("back to {prev}");
            0
        }
        Commands::ResolveTie { index, team, by } => {
            let team: Team = team.parse()?;
            let decision = ctl.resolve_tie(index, team, &by)?;
            persist(&mut ctl)?;
            println!("tie resolved for {} (decision {})", decision.chosen, decision.id);
            0
        }
        Commands::Export { out_csv, beds_csv } => {
            let calcs = ctl
                .calculations()
                .ok_or_else(|| anyhow!("no allocation to export"))?;
            io::export_pca_csv(&out_csv, &calcs, ctl.state().roster())?;
            if let Some(path) = beds_csv {
                let file = std::fs::File::create(&path)?;
                io::write_bed_transfers_csv(file, &calcs)?;
            }
            0
        }
    };

    std::process::exit(code);
}
