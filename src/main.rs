use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use torrent_core::magnet;
use torrent_core::metainfo::MetaInfo;
use torrent_core::session::Session;
use torrent_core::settings::SettingsPack;
use torrent_core::torrent::AddTorrentParams;

#[derive(Parser, Debug)]
#[command(name = "torrent-core", about = "BitTorrent protocol engine core CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a `.torrent` file and print the resulting torrent state.
    Add {
        #[arg(short, long, help = "path to a *.torrent file")]
        file: String,
        #[arg(short, long, default_value = ".", help = "directory to save downloaded files in")]
        out: String,
    },
    /// Add a magnet link (metadata-only until peers supply it) and print
    /// what was parsed out of it.
    Magnet {
        #[arg(help = "magnet: URI")]
        uri: String,
        #[arg(short, long, default_value = ".", help = "directory to save downloaded files in")]
        out: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let mut session = Session::new(SettingsPack::default());

    match args.command {
        Command::Add { file, out } => {
            let metainfo = MetaInfo::from_file(&file).context("failed to parse torrent file")?;
            let params = AddTorrentParams {
                metainfo: Some(metainfo),
                save_path: out,
                ..AddTorrentParams::default()
            };
            let id = session
                .add_torrent(params, current_epoch())
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let torrent = session.get(id).expect("just-inserted handle is valid");
            println!("added torrent {} ({} pieces), state {:?}", torrent.info_hash, torrent.piece_count(), torrent.state);
        }
        Command::Magnet { uri, out } => {
            let parsed = magnet::parse(&uri).context("failed to parse magnet uri")?;
            let params = AddTorrentParams {
                info_hash: parsed.info_hash.clone(),
                save_path: out,
                trackers: parsed.trackers.clone(),
                web_seeds: parsed.web_seeds.clone(),
                select_only: parsed.select_only.clone(),
                select_only_present: parsed.select_only_present,
                ..AddTorrentParams::default()
            };
            let id = session
                .add_torrent(params, current_epoch())
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let torrent = session.get(id).expect("just-inserted handle is valid");
            println!("added magnet {} , state {:?}", torrent.info_hash, torrent.state);
        }
    }

    for alert in session.pop_alerts() {
        println!("{:?}", alert.kind);
    }
    Ok(())
}

fn current_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
