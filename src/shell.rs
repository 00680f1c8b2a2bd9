//! Operator shell: a stdin REPL over a running `Cluster`, grounded in
//! `examples/original_source/main.py`'s `while True: input("Input command: ")`
//! loop — same five commands, same "Too many arguments"/"Unknown command"
//! messages, same post-mutation `print_system()` dump.

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::membership::Cluster;
use crate::wire::{Order, PeerId};

pub async fn run(mut cluster: Cluster) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Byzantine Generals demo ready. Commands: actual-order, g-kill, g-add, g-state, exit");
    cluster.print_system().await;

    loop {
        print!("Input command: ");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => break,
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }

        // Mirrors `examples/original_source/main.py`: the arity check comes
        // before command dispatch, so any command gets the same message.
        if words.len() > 3 {
            println!("Too many arguments");
            continue;
        }

        match words.as_slice() {
            ["exit"] => break,
            ["actual-order", value] => match Order::parse_wire(value) {
                Ok(Order::Undecided) | Err(_) => {
                    println!("order must be 'attack' or 'retreat'");
                }
                Ok(value) => match cluster.send_order(value).await {
                    Ok((decision, votes)) => {
                        println!("decision: {decision}");
                        for (pid, vote) in votes {
                            println!("  {pid}: {vote}");
                        }
                    }
                    Err(err) => println!("order failed: {err}"),
                },
            },
            ["g-kill", id] => {
                let target = PeerId::from(*id);
                match cluster.remove_node(&target).await {
                    Ok(()) => cluster.print_system().await,
                    Err(err) => println!("g-kill failed: {err}"),
                }
                warn_if_quorum_broken(&cluster);
            }
            ["g-add", count] => match count.parse::<usize>() {
                Ok(count) => {
                    cluster.add_nodes(count).await;
                    cluster.print_system().await;
                    warn_if_quorum_broken(&cluster);
                }
                Err(_) => println!("g-add expects an integer count"),
            },
            ["g-state", id, state] => {
                let target = PeerId::from(*id);
                let faulty = match state.to_ascii_lowercase().as_str() {
                    "faulty" => true,
                    "non-faulty" => false,
                    _ => {
                        println!("state must be 'Faulty' or 'Non-faulty'");
                        continue;
                    }
                };
                match cluster.set_state(&target, faulty).await {
                    Ok(()) => cluster.print_system().await,
                    Err(err) => println!("g-state failed: {err}"),
                }
                warn_if_quorum_broken(&cluster);
            }
            _ => println!("Unknown command"),
        }
    }
}

fn warn_if_quorum_broken(cluster: &Cluster) {
    if let Some(warning) = cluster.quorum_warning() {
        log::warn!("{warning}");
    }
}
