//! # Cli
//!
//! Option table of the capture helper and the frontend-facing actions. Options
//! are handled in the order they were given: see `dispatch`.

use std::{
    ffi::OsString,
    io::{self, Write},
    path::PathBuf,
};

use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::debug;

use crate::{
    core::kube::{Kubectl, Orchestrator},
    dump,
    interfaces::{
        self,
        host::{HostLinks, PcapDevices},
        Enumerator,
    },
};

pub(crate) mod dispatch;

pub(crate) use dispatch::{dispatch, Actions, Deferred, Invocation, Step};

/// Default location of the compiled kernel instrumentation.
pub(crate) const DEFAULT_EBPF_OBJECT: &str = "/usr/share/ebpfdump/ebpf_flow.bpf.o";

const LIST_INTERFACES: &str = "extcap-interfaces";
const VERSION: &str = "extcap-version";
const LIST_DLTS: &str = "extcap-dlts";
const INTERFACE: &str = "extcap-interface";
const CONFIG: &str = "extcap-config";
const CAPTURE: &str = "capture";
const FIFO: &str = "fifo";
const DEBUG: &str = "debug";
const HELP: &str = "help";
const NAME: &str = "name";
const CUSTOM_NAME: &str = "custom-name";
const EBPF_OBJECT: &str = "ebpf-object";
const OPERANDS: &str = "operands";

/// Everything the selected action needs, built once from the options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct SessionConfig {
    pub(crate) interface: Option<String>,
    pub(crate) fifo: Option<PathBuf>,
    pub(crate) debug: bool,
    pub(crate) name: Option<String>,
    pub(crate) custom_name: Option<String>,
    pub(crate) ebpf_object: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interface: None,
            fifo: None,
            debug: false,
            name: None,
            custom_name: None,
            ebpf_object: PathBuf::from(DEFAULT_EBPF_OBJECT),
        }
    }
}

impl SessionConfig {
    /// Name given to the capture by the user, if any.
    pub(crate) fn display_name(&self) -> Option<&str> {
        self.custom_name.as_deref().or(self.name.as_deref())
    }
}

// Flags accept an optional "=value" so that every occurrence is recorded
// along with its position.
fn flag(id: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .num_args(0..=1)
        .require_equals(true)
        .default_missing_value("")
        .action(ArgAction::Append)
        .help(help)
}

fn value(id: &'static str, value_name: &'static str, help: &'static str) -> Arg {
    Arg::new(id)
        .long(id)
        .value_name(value_name)
        .action(ArgAction::Append)
        .help(help)
}

pub(crate) fn command() -> Command {
    Command::new("ebpfdump")
        .about("Wireshark extcap eBPF plugin")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .ignore_errors(true)
        .arg(flag(LIST_INTERFACES, "List the available interfaces"))
        .arg(flag(VERSION, "Print the plugin version"))
        .arg(flag(LIST_DLTS, "List the link-layer types of the selected interface"))
        .arg(value(INTERFACE, "NAME", "Select the interface to work on"))
        .arg(flag(CONFIG, "List the configuration arguments of the selected interface"))
        .arg(flag(CAPTURE, "Start capturing"))
        .arg(value(FIFO, "PATH", "Write the capture to PATH"))
        .arg(flag(DEBUG, "Enable debug traces"))
        .arg(flag(HELP, "Print this help").short('h'))
        .arg(value(NAME, "NAME", "Name of the interface"))
        .arg(value(CUSTOM_NAME, "NAME", "Custom name of the interface"))
        .arg(value(
            EBPF_OBJECT,
            "PATH",
            "Compiled eBPF instrumentation to load [default: /usr/share/ebpfdump/ebpf_flow.bpf.o]",
        ))
        .arg(
            Arg::new(OPERANDS)
                .num_args(0..)
                .action(ArgAction::Append)
                .hide(true),
        )
}

/// Drop the options the command does not know about, the way a permissive
/// option parser skips them.
fn known_args(cmd: &Command, args: Vec<OsString>) -> Vec<OsString> {
    let longs: Vec<&str> = cmd.get_arguments().filter_map(|a| a.get_long()).collect();
    let shorts: Vec<char> = cmd.get_arguments().filter_map(|a| a.get_short()).collect();

    args.into_iter()
        .enumerate()
        .filter(|(i, arg)| {
            if *i == 0 {
                return true;
            }
            let arg = arg.to_string_lossy();
            if let Some(long) = arg.strip_prefix("--") {
                let name = long.split('=').next().unwrap_or_default();
                if name.is_empty() || longs.contains(&name) {
                    return true;
                }
                debug!("Ignoring unknown option {arg}");
                return false;
            }
            match arg.strip_prefix('-') {
                Some(short) if !short.chars().all(|c| shorts.contains(&c)) => {
                    debug!("Ignoring unknown option {arg}");
                    false
                }
                _ => true,
            }
        })
        .map(|(_, arg)| arg)
        .collect()
}

/// Whether debug traces are asked for, looked up before the options are
/// parsed.
pub(crate) fn debug_requested(args: &[OsString]) -> bool {
    args.iter().skip(1).any(|arg| {
        let arg = arg.to_string_lossy();
        arg == "--debug" || arg.starts_with("--debug=")
    })
}

fn last(matches: &ArgMatches, id: &str) -> Option<String> {
    matches
        .get_many::<String>(id)
        .and_then(|mut vals| vals.next_back())
        .cloned()
}

fn positions(matches: &ArgMatches, id: &str, step: Step) -> Vec<(usize, Step)> {
    matches
        .indices_of(id)
        .map(|indices| indices.map(|i| (i, step)).collect())
        .unwrap_or_default()
}

/// Parse the invocation into a configuration and the ordered list of steps
/// the options ask for.
pub(crate) fn parse<I, T>(args: I) -> Invocation
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    // Nothing asked for, show what can be.
    if args.len() <= 1 {
        return Invocation {
            config: SessionConfig::default(),
            steps: vec![Step::Help],
        };
    }

    let cmd = command();
    let args = known_args(&cmd, args);
    let matches = match cmd.try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(e) => {
            debug!("Ignoring malformed options: {e}");
            ArgMatches::default()
        }
    };

    let config = SessionConfig {
        interface: last(&matches, INTERFACE),
        fifo: last(&matches, FIFO).map(PathBuf::from),
        debug: matches.contains_id(DEBUG),
        name: last(&matches, NAME),
        custom_name: last(&matches, CUSTOM_NAME),
        ebpf_object: last(&matches, EBPF_OBJECT)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_EBPF_OBJECT)),
    };

    let mut steps: Vec<(usize, Step)> = [
        (LIST_INTERFACES, Step::ListInterfaces),
        (VERSION, Step::Version),
        (HELP, Step::Help),
        (LIST_DLTS, Step::Arm(Deferred::LinkTypes)),
        (CONFIG, Step::Arm(Deferred::ConfigSchema)),
        (CAPTURE, Step::Arm(Deferred::Capture)),
    ]
    .into_iter()
    .flat_map(|(id, step)| positions(&matches, id, step))
    .collect();
    steps.sort_by_key(|(i, _)| *i);

    Invocation {
        config,
        steps: steps.into_iter().map(|(_, step)| step).collect(),
    }
}

/// Control protocol version line.
pub(crate) fn version_line() -> String {
    format!("extcap {{version={}}}", env!("CARGO_PKG_VERSION"))
}

/// Actions answering the capture frontend on the given output.
pub(crate) struct Frontend<W: Write> {
    out: W,
}

impl Frontend<io::Stdout> {
    pub(crate) fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> Frontend<W> {
    #[cfg(test)]
    pub(crate) fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Actions for Frontend<W> {
    fn list_interfaces(&mut self, _: &SessionConfig) -> Result<()> {
        let kubectl = Kubectl::detect().found("orchestration tool");
        let enumerator = Enumerator::new(
            kubectl.as_ref().map(|k| k as &dyn Orchestrator),
            &HostLinks,
            &PcapDevices,
        );
        enumerator.list_interfaces(&mut self.out)?;
        self.out.flush()?;
        Ok(())
    }

    fn version(&mut self) -> Result<()> {
        writeln!(self.out, "{}", version_line())?;
        Ok(())
    }

    fn help(&mut self) -> Result<()> {
        writeln!(self.out, "{}", command().render_help())?;
        Ok(())
    }

    fn link_types(&mut self, config: &SessionConfig) -> Result<()> {
        interfaces::list_link_types(config.interface.as_deref(), &mut self.out)
    }

    fn config_schema(&mut self, config: &SessionConfig) -> Result<()> {
        interfaces::describe_config_schema(config.interface.as_deref(), &mut self.out)
    }

    fn capture(&mut self, config: &SessionConfig) -> Result<()> {
        self.out.flush()?;
        dump::capture(config)
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn args(line: &str) -> Vec<String> {
        std::iter::once("ebpfdump".to_string())
            .chain(line.split_whitespace().map(String::from))
            .collect()
    }

    #[test]
    fn command_is_valid() {
        command().debug_assert();
    }

    #[test]
    fn no_argument_is_help() {
        assert_eq!(parse(["ebpfdump"]).steps, vec![Step::Help]);
    }

    #[test]
    fn config_from_options() {
        let inv = parse(args(
            "--extcap-interface eth0 --fifo /tmp/fifo --debug --name a --custom-name b --extcap-interface=veth7",
        ));
        assert_eq!(
            inv.config,
            SessionConfig {
                interface: Some("veth7".to_string()),
                fifo: Some(PathBuf::from("/tmp/fifo")),
                debug: true,
                name: Some("a".to_string()),
                custom_name: Some("b".to_string()),
                ebpf_object: PathBuf::from(DEFAULT_EBPF_OBJECT),
            }
        );
        assert!(inv.steps.is_empty());
        assert_eq!(inv.config.display_name(), Some("b"));
    }

    #[test_case("--capture --debug", true ; "flag")]
    #[test_case("--debug=1 --bogus", true ; "with value")]
    #[test_case("--debugger --capture", false ; "other option")]
    #[test_case("--capture", false ; "absent")]
    fn debug_lookup(line: &str, expected: bool) {
        let args: Vec<OsString> = args(line).into_iter().map(OsString::from).collect();
        assert_eq!(debug_requested(&args), expected);
    }

    #[test]
    fn ebpf_object_option() {
        let inv = parse(args("--capture --ebpf-object /opt/flow.o"));
        assert_eq!(inv.config.ebpf_object, PathBuf::from("/opt/flow.o"));
    }

    #[test_case("--extcap-config --capture", vec![Step::Arm(Deferred::ConfigSchema), Step::Arm(Deferred::Capture)] ; "in order")]
    #[test_case("--capture --extcap-interfaces", vec![Step::Arm(Deferred::Capture), Step::ListInterfaces] ; "immediate after")]
    #[test_case("--extcap-version=4.2 --extcap-dlts --extcap-version", vec![Step::Version, Step::Arm(Deferred::LinkTypes), Step::Version] ; "repeated")]
    #[test_case("--extcap-interfaces -h", vec![Step::ListInterfaces, Step::Help] ; "short help")]
    #[test_case("--bogus --capture --what=ever -x", vec![Step::Arm(Deferred::Capture)] ; "unknown ignored")]
    #[test_case("--extcap-interface ebpf", vec![] ; "selection only")]
    fn steps(line: &str, expected: Vec<Step>) {
        assert_eq!(parse(args(line)).steps, expected);
    }

    #[test]
    fn version() {
        let mut out = Vec::new();
        Frontend::new(&mut out).version().unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "extcap {version=0.1.0}\n");
    }

    #[test]
    fn help_lists_options() {
        let mut out = Vec::new();
        Frontend::new(&mut out).help().unwrap();
        let help = String::from_utf8(out).unwrap();
        for opt in ["--extcap-interfaces", "--fifo <PATH>", "--custom-name <NAME>", "--help"] {
            assert!(help.contains(opt), "missing {opt}");
        }
    }

    #[test]
    fn frontend_link_types() {
        let config = SessionConfig {
            interface: Some("ebpf".to_string()),
            ..Default::default()
        };
        let mut out = Vec::new();
        Frontend::new(&mut out).link_types(&config).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "dlt {number=1}{name=ebpf}{display=The EN10MB Ethernet2 DLT}\n"
        );
    }
}
