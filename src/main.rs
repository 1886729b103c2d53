use clap::Parser;
use std::sync::Arc;

mod batch;
mod broadcast;
mod cli;
mod config;
mod error;
mod fee;
mod guard;
mod menu;
mod prompt;
mod rpc;
mod script;
mod session;
mod signing;
mod status;
mod transaction;
mod types;
mod utxo;

#[cfg(test)]
mod testutil;

use cli::{CliArgs, Command};
use config::MultisigConfig;
use error::AppError;
use menu::App;
use prompt::StdinPrompter;
use rpc::{CliNode, NodeRpc};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let config = MultisigConfig::load(&args)?;
    log::debug!("設定: {:?}", config);

    let node: Arc<dyn NodeRpc> = Arc::new(CliNode::new(
        config.node.cli_path.clone(),
        config.node.cli_args.clone(),
    ));

    if let (Some(path), Some(address)) = (&config.status_file, &config.p2sh_address) {
        // 完了を待たずにメニューを表示する
        status::spawn_status_refresh(node.clone(), address.clone(), config.fetch_options(), path.clone());
    }

    let mut prompter = StdinPrompter::new(args.yes);
    let mut app = App::new(node, &config, &mut prompter);

    match args.command.unwrap_or(Command::Menu) {
        Command::Menu => app.run_menu()?,
        Command::Send { to, amount } => app.create_send(to, amount)?,
        Command::Sign { session } => app.sign_partial(session)?,
        Command::Broadcast { session } => app.broadcast(session)?,
        Command::Consolidate {
            max_batches,
            auto_broadcast,
        } => app.consolidate(max_batches, auto_broadcast)?,
        Command::Status => app.show_status()?,
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}
