//! Command interpreter.
//!
//! Commands come from the start-up script, the interactive prompt and the
//! control service; all of them go through [`execute_line`].

use std::fmt::Write;
use std::path::Path;
use std::str::FromStr;

use crate::error::Error;
use crate::eventq::ScheduleType;
use crate::link::LinkConfig;
use crate::memory::PoolConfig;
use crate::stage::{CoreMask, Direction};
use crate::vswitch::Vswitch;
use crate::Result;

pub const HELP: &str = "\
stage add <name> [coremask <mask>]
stage rem <name>
stage show <name>
stage set <name> type rx|worker|tx
stage set <name> queue in <id> schedule atomic|ordered [mempool <name>]
stage set <name> queue out <id> schedule atomic|ordered
stage set <name> link <dev> queue in|out <id>
stage set <name> graph <node,list>
link <dev> config rxq <n> txq <n> mempool <name>
link <dev> config promiscuous on|off
link <dev> config mtu <n>
link <dev> config peer <dev>
link <dev> rem
link show
link <dev> show
mempool add <name> [size <n>] [mbufs <n>] [cache <n>] [numa <n>]
mempool rem <name>
mempool show <name>
vswitch start
vswitch show
vswitch stats
help
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StageAdd {
        name: String,
        coremask: CoreMask,
    },
    StageRem(String),
    StageShow(String),
    StageSetType {
        name: String,
        role: String,
    },
    StageSetQueueIn {
        name: String,
        qid: u8,
        schedule: ScheduleType,
        pool: String,
    },
    StageSetQueueOut {
        name: String,
        qid: u8,
        schedule: ScheduleType,
    },
    StageSetLinkQueue {
        name: String,
        link: String,
        dir: Direction,
        qid: u16,
    },
    StageSetGraph {
        name: String,
        nodes: String,
    },
    LinkConfig(LinkConfig),
    LinkPromiscuous {
        link: String,
        enable: bool,
    },
    LinkMtu {
        link: String,
        mtu: u16,
    },
    LinkPeer {
        link: String,
        peer: String,
    },
    LinkRem(String),
    LinkShow(Option<String>),
    MempoolAdd(PoolConfig),
    MempoolRem(String),
    MempoolShow(String),
    VswitchStart,
    VswitchShow,
    VswitchStats,
    Help,
}

fn num<T: FromStr>(tok: Option<&str>, what: &str) -> Result<T> {
    let tok = tok.ok_or_else(|| Error::invalid(format!("missing {what}")))?;
    tok.parse()
        .map_err(|_| Error::invalid(format!("{what} '{tok}'")))
}

fn word<'a>(tok: Option<&'a str>, what: &str) -> Result<&'a str> {
    tok.ok_or_else(|| Error::invalid(format!("missing {what}")))
}

fn keyword(tok: Option<&str>, expected: &str) -> Result<()> {
    match tok {
        Some(t) if t == expected => Ok(()),
        Some(t) => Err(Error::invalid(format!("'{t}', expected '{expected}'"))),
        None => Err(Error::invalid(format!("missing '{expected}'"))),
    }
}

fn end<'a>(mut toks: impl Iterator<Item = &'a str>) -> Result<()> {
    match toks.next() {
        Some(t) => Err(Error::invalid(format!("unexpected '{t}'"))),
        None => Ok(()),
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut toks = line.split_whitespace();

        let cmd = match toks.next() {
            Some("stage") => parse_stage(&mut toks)?,
            Some("link") => parse_link(&mut toks)?,
            Some("mempool") => parse_mempool(&mut toks)?,
            Some("vswitch") => match toks.next() {
                Some("start") => Command::VswitchStart,
                Some("show") => Command::VswitchShow,
                Some("stats") => Command::VswitchStats,
                other => return Err(Error::invalid(format!("vswitch {}", other.unwrap_or("")))),
            },
            Some("help") => Command::Help,
            Some(other) => return Err(Error::invalid(format!("command '{other}'"))),
            None => return Err(Error::invalid("empty command")),
        };
        end(toks)?;

        Ok(cmd)
    }
}

fn parse_stage<'a>(toks: &mut impl Iterator<Item = &'a str>) -> Result<Command> {
    let action = word(toks.next(), "stage action")?;
    let name = word(toks.next(), "stage name")?.to_string();

    match action {
        "add" => {
            let coremask = match toks.next() {
                Some("coremask") => word(toks.next(), "coremask")?.parse()?,
                Some(t) => return Err(Error::invalid(format!("unexpected '{t}'"))),
                None => CoreMask::empty(),
            };
            Ok(Command::StageAdd { name, coremask })
        }
        "rem" => Ok(Command::StageRem(name)),
        "show" => Ok(Command::StageShow(name)),
        "set" => parse_stage_set(name, toks),
        other => Err(Error::invalid(format!("stage {other}"))),
    }
}

fn parse_stage_set<'a>(name: String, toks: &mut impl Iterator<Item = &'a str>) -> Result<Command> {
    match word(toks.next(), "stage attribute")? {
        "type" => Ok(Command::StageSetType {
            name,
            role: word(toks.next(), "stage type")?.to_string(),
        }),
        "queue" => {
            let dir = word(toks.next(), "queue direction")?;
            let qid = num(toks.next(), "queue id")?;
            keyword(toks.next(), "schedule")?;
            let schedule = word(toks.next(), "schedule type")?.parse()?;

            match dir {
                "in" => {
                    let pool = match toks.next() {
                        Some("mempool") => word(toks.next(), "mempool")?.to_string(),
                        Some(t) => return Err(Error::invalid(format!("unexpected '{t}'"))),
                        None => String::new(),
                    };
                    Ok(Command::StageSetQueueIn {
                        name,
                        qid,
                        schedule,
                        pool,
                    })
                }
                "out" => Ok(Command::StageSetQueueOut {
                    name,
                    qid,
                    schedule,
                }),
                other => Err(Error::invalid(format!("queue direction '{other}'"))),
            }
        }
        "link" => {
            let link = word(toks.next(), "link")?.to_string();
            keyword(toks.next(), "queue")?;
            let dir = match word(toks.next(), "queue direction")? {
                "in" => Direction::In,
                "out" => Direction::Out,
                other => return Err(Error::invalid(format!("queue direction '{other}'"))),
            };
            let qid = num(toks.next(), "queue id")?;
            Ok(Command::StageSetLinkQueue {
                name,
                link,
                dir,
                qid,
            })
        }
        "graph" => Ok(Command::StageSetGraph {
            name,
            nodes: word(toks.next(), "node list")?.to_string(),
        }),
        other => Err(Error::invalid(format!("stage attribute '{other}'"))),
    }
}

fn parse_link<'a>(toks: &mut impl Iterator<Item = &'a str>) -> Result<Command> {
    let dev = word(toks.next(), "link")?;
    if dev == "show" {
        return Ok(Command::LinkShow(None));
    }
    let link = dev.to_string();

    match word(toks.next(), "link action")? {
        "show" => Ok(Command::LinkShow(Some(link))),
        "rem" => Ok(Command::LinkRem(link)),
        "config" => match word(toks.next(), "link attribute")? {
            "rxq" => {
                let nb_rxq = num(toks.next(), "rxq")?;
                keyword(toks.next(), "txq")?;
                let nb_txq = num(toks.next(), "txq")?;
                keyword(toks.next(), "mempool")?;
                let pool = word(toks.next(), "mempool")?.to_string();
                Ok(Command::LinkConfig(LinkConfig {
                    name: link,
                    nb_rxq,
                    nb_txq,
                    pool,
                }))
            }
            "promiscuous" => {
                let enable = match word(toks.next(), "on|off")? {
                    "on" => true,
                    "off" => false,
                    other => return Err(Error::invalid(format!("promiscuous '{other}'"))),
                };
                Ok(Command::LinkPromiscuous { link, enable })
            }
            "mtu" => Ok(Command::LinkMtu {
                link,
                mtu: num(toks.next(), "mtu")?,
            }),
            "peer" => Ok(Command::LinkPeer {
                link,
                peer: word(toks.next(), "peer")?.to_string(),
            }),
            other => Err(Error::invalid(format!("link attribute '{other}'"))),
        },
        other => Err(Error::invalid(format!("link action '{other}'"))),
    }
}

fn parse_mempool<'a>(toks: &mut impl Iterator<Item = &'a str>) -> Result<Command> {
    let action = word(toks.next(), "mempool action")?;
    let name = word(toks.next(), "mempool name")?;

    match action {
        "add" => {
            let mut config = PoolConfig::new(name);
            while let Some(key) = toks.next() {
                match key {
                    "size" => config.mbuf_sz = num(toks.next(), "size")?,
                    "mbufs" => config.nb_mbufs = num(toks.next(), "mbufs")?,
                    "cache" => config.cache_sz = num(toks.next(), "cache")?,
                    "numa" => config.numa_node = num(toks.next(), "numa")?,
                    other => return Err(Error::invalid(format!("mempool option '{other}'"))),
                }
            }
            Ok(Command::MempoolAdd(config))
        }
        "rem" => Ok(Command::MempoolRem(name.to_string())),
        "show" => Ok(Command::MempoolShow(name.to_string())),
        other => Err(Error::invalid(format!("mempool {other}"))),
    }
}

/// Run one command, returning what it prints.
pub fn execute(vs: &mut Vswitch, cmd: Command) -> Result<String> {
    let mut out = String::new();

    match cmd {
        Command::StageAdd { name, coremask } => {
            vs.stages_mut().add(&name, coremask)?;
        }
        Command::StageRem(name) => vs.stages_mut().remove(&name)?,
        Command::StageShow(name) => {
            let _ = writeln!(out, "{}", vs.stages().lookup(&name)?.show());
        }
        Command::StageSetType { name, role } => vs.stages_mut().set_role(&name, &role)?,
        Command::StageSetQueueIn {
            name,
            qid,
            schedule,
            pool,
        } => vs
            .stages_mut()
            .set_input_queue(&name, qid, schedule, &pool)?,
        Command::StageSetQueueOut {
            name,
            qid,
            schedule,
        } => vs.stages_mut().set_output_queue(&name, qid, schedule)?,
        Command::StageSetLinkQueue {
            name,
            link,
            dir,
            qid,
        } => {
            let (stages, links) = vs.stages_and_links();
            match dir {
                Direction::In => stages.set_ingress_link_queue(&name, links, &link, qid)?,
                Direction::Out => stages.set_egress_link_queue(&name, links, &link, qid)?,
            }
        }
        Command::StageSetGraph { name, nodes } => {
            vs.stages_mut().set_extra_graph_nodes(&name, &nodes)?
        }
        Command::LinkConfig(config) => {
            let (links, pools) = vs.links_and_pools();
            links.add(config, pools)?;
        }
        Command::LinkPromiscuous { link, enable } => {
            vs.links_mut().set_promiscuous(&link, enable)?
        }
        Command::LinkMtu { link, mtu } => vs.links_mut().set_mtu(&link, mtu)?,
        Command::LinkPeer { link, peer } => vs.links_mut().set_peer(&link, &peer)?,
        Command::LinkRem(name) => vs.remove_link(&name)?,
        Command::LinkShow(None) => {
            for link in vs.links().iter() {
                out.push_str(&vs.links().show(link));
            }
        }
        Command::LinkShow(Some(name)) => {
            let links = vs.links();
            out.push_str(&links.show(links.lookup(&name)?));
        }
        Command::MempoolAdd(config) => {
            vs.pools_mut().add(config)?;
        }
        Command::MempoolRem(name) => vs.pools_mut().remove(&name)?,
        Command::MempoolShow(name) => {
            let pool = vs
                .pools()
                .get(&name)
                .ok_or_else(|| Error::not_found(name.as_str()))?;
            let c = pool.config();
            let _ = writeln!(
                out,
                "{}: nb_mbufs={}, mbuf_sz={}, cache {} numa {} in_use {}",
                c.name,
                c.nb_mbufs,
                c.mbuf_sz,
                c.cache_sz,
                c.numa_node,
                pool.in_use()
            );
        }
        Command::VswitchStart => {
            out.push_str("Starting vswitch...\n");
            vs.start()?;
            out.push_str("Done.\n");
        }
        Command::VswitchShow => out.push_str(&vs.show()),
        Command::VswitchStats => out.push_str(&vs.stats()?),
        Command::Help => out.push_str(HELP),
    }

    Ok(out)
}

/// Parse and run one line. Failures are reported in the output, naming
/// the command and the cause.
pub fn execute_line(vs: &mut Vswitch, line: &str) -> std::result::Result<String, String> {
    let line = line.trim();
    let res = line.parse().and_then(|cmd| execute(vs, cmd));

    res.map_err(|e| format!("{line} failed: {e}\n"))
}

/// Run every line of a script. Blank lines and `#` comments are skipped; a
/// failing line is logged and the script goes on. Returns the number of
/// failed lines.
pub fn execute_script(vs: &mut Vswitch, path: &Path) -> Result<usize> {
    let script = std::fs::read_to_string(path)?;
    let mut failed = 0;

    for (lineno, line) in script.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match execute_line(vs, line) {
            Ok(out) => {
                if !out.is_empty() {
                    log::info!("{}", out.trim_end());
                }
            }
            Err(msg) => {
                log::error!("{}:{}: {}", path.display(), lineno + 1, msg.trim_end());
                failed += 1;
            }
        }
    }

    log::debug!("{} executed, {} failed", path.display(), failed);

    Ok(failed)
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::config::Params;
    use crate::device::SoftEthDevice;
    use crate::eventdev::SoftEventDevice;

    fn vswitch() -> Vswitch {
        let params = Params {
            nb_lcores: 4,
            ports: vec!["eth0".to_string(), "eth1".to_string()],
            ..Default::default()
        };
        let eth = Arc::new(SoftEthDevice::new(&params.ports[..]));
        Vswitch::new(params, eth, Arc::new(SoftEventDevice::new())).unwrap()
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "stage add s0 coremask 0x6".parse::<Command>().unwrap(),
            Command::StageAdd {
                name: "s0".to_string(),
                coremask: CoreMask(6)
            }
        );
        assert_eq!(
            "stage set s1 queue in 0 schedule ordered mempool mp0"
                .parse::<Command>()
                .unwrap(),
            Command::StageSetQueueIn {
                name: "s1".to_string(),
                qid: 0,
                schedule: ScheduleType::Ordered,
                pool: "mp0".to_string()
            }
        );
        assert_eq!(
            "link eth0 config rxq 2 txq 1 mempool mp0"
                .parse::<Command>()
                .unwrap(),
            Command::LinkConfig(LinkConfig {
                name: "eth0".to_string(),
                nb_rxq: 2,
                nb_txq: 1,
                pool: "mp0".to_string()
            })
        );
        assert_eq!("link show".parse::<Command>().unwrap(), Command::LinkShow(None));
        assert_eq!(
            "link eth1 rem".parse::<Command>().unwrap(),
            Command::LinkRem("eth1".to_string())
        );

        match "mempool add mp1 mbufs 512 numa 1".parse::<Command>().unwrap() {
            Command::MempoolAdd(c) => {
                assert_eq!(c.nb_mbufs, 512);
                assert_eq!(c.numa_node, 1);
                assert_eq!(c.cache_sz, 256);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_errors() {
        for line in [
            "",
            "stage",
            "stage add",
            "stage set s0 queue in x schedule atomic",
            "stage set s0 queue out 0 schedule fifo",
            "stage set s0 link eth0 queue sideways 0",
            "link eth0 config promiscuous maybe",
            "vswitch start now",
            "frobnicate",
        ] {
            assert!(line.parse::<Command>().is_err(), "{line}");
        }
    }

    #[test]
    fn test_failures_name_the_command() {
        let mut vs = vswitch();

        let err = execute_line(&mut vs, "stage rem nope").unwrap_err();
        assert_eq!(err, "stage rem nope failed: nope: not found\n");

        let err = execute_line(&mut vs, "stage add s0 coremask 0x1").unwrap_err();
        assert!(err.contains("core 0 is not enabled"));
    }

    #[test]
    fn test_configure_and_show() {
        let mut vs = vswitch();
        for line in [
            "mempool add mp0 mbufs 1024",
            "link eth0 config rxq 1 txq 1 mempool mp0",
            "link eth0 config mtu 1500",
            "link eth0 config promiscuous on",
            "link eth0 config peer eth0",
            "stage add s0 coremask 0x2",
            "stage set s0 type rx",
            "stage set s0 queue out 0 schedule atomic",
            "stage set s0 link eth0 queue in 0",
        ] {
            execute_line(&mut vs, line).unwrap();
        }

        let out = execute_line(&mut vs, "stage show s0").unwrap();
        assert_eq!(out, "s0: stage_id=0 coremask:0x0002 type rx out 0 atomic\n");

        let out = execute_line(&mut vs, "link eth0 show").unwrap();
        assert!(out.contains("flags=<PROMISC> mtu 1500"));
        assert!(out.contains("peer eth0"));

        let out = execute_line(&mut vs, "mempool show mp0").unwrap();
        assert!(out.starts_with("mp0: nb_mbufs=1024"));

        assert!(execute_line(&mut vs, "link eth0 config peer eth1").is_err());

        let err = execute_line(&mut vs, "link eth0 rem").unwrap_err();
        assert_eq!(
            err,
            "link eth0 rem failed: link eth0 is used by stage s0: invalid argument\n"
        );
        execute_line(&mut vs, "stage rem s0").unwrap();
        execute_line(&mut vs, "link eth0 rem").unwrap();
        assert_eq!(execute_line(&mut vs, "link show").unwrap(), "");
    }

    #[test]
    fn test_script_continues_after_failure() {
        let mut vs = vswitch();
        let path = std::env::temp_dir().join(format!("vswitch-script-{}.cli", std::process::id()));
        std::fs::write(
            &path,
            "# pools\n\nmempool add mp0\nmempool add mp0\nstage add s0 coremask 0x2\n",
        )
        .unwrap();

        assert_eq!(execute_script(&mut vs, &path).unwrap(), 1);
        assert!(vs.stages().get("s0").is_some());
        let _ = std::fs::remove_file(path);

        assert!(execute_script(&mut vs, Path::new("/nonexistent.cli")).is_err());
    }
}
