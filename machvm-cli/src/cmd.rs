use std::path::PathBuf;

use argh::{FromArgValue, FromArgs};
use machvm::{Pid, Protection};

/// An address or size given as `0x`-prefixed hex or as decimal.
#[derive(Debug, Clone, Copy)]
pub struct Address(pub u64);

impl FromArgValue for Address {
    fn from_arg_value(value: &str) -> Result<Self, String> {
        let value = value.trim().replace('_', "");
        let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => value.parse(),
        };
        parsed.map(Self).map_err(|e| format!("invalid number {value}: {e}"))
    }
}

/// Bytes given as hex, e.g. `deadbeef` or `de ad be ef`.
#[derive(Debug, Clone)]
pub struct HexBytes(pub Vec<u8>);

impl FromArgValue for HexBytes {
    fn from_arg_value(value: &str) -> Result<Self, String> {
        let digits: Vec<u8> = value
            .trim_start_matches("0x")
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        if digits.is_empty() || digits.len() % 2 != 0 {
            return Err(format!("invalid hex bytes: {value}"));
        }
        digits
            .chunks(2)
            .map(|pair| {
                core::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or(format!("invalid hex bytes: {value}"))
            })
            .collect::<Result<_, _>>()
            .map(Self)
    }
}

#[derive(FromArgs)]
#[argh(description = "inspect and patch the memory of mach tasks.")]
pub struct Commands {
    #[argh(subcommand)]
    pub cmds: CommandEnum,
}

#[derive(FromArgs)]
#[argh(subcommand)]
pub enum CommandEnum {
    TaskSelf(SubCommandSelf),
    Task(SubCommandTask),
    Regions(SubCommandRegions),
    Read(SubCommandRead),
    Write(SubCommandWrite),
    Protect(SubCommandProtect),
    MainBinary(SubCommandMainBinary),
    Image(SubCommandImage),
    Slide(SubCommandSlide),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "self", description = "print the task port of this process")]
pub struct SubCommandSelf {}

#[derive(FromArgs)]
#[argh(subcommand, name = "task", description = "acquire the task port of a process")]
pub struct SubCommandTask {
    #[argh(option, short = 'p', description = "process id")]
    pub pid: Pid,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "regions", description = "list mapped regions")]
pub struct SubCommandRegions {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "read", description = "read memory")]
pub struct SubCommandRead {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,

    #[argh(option, short = 'a', description = "start address")]
    pub address: Address,

    #[argh(option, short = 's', description = "number of bytes")]
    pub size: Address,

    #[argh(option, description = "write the bytes to this file instead of a hexdump")]
    pub out: Option<PathBuf>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "write", description = "write memory")]
pub struct SubCommandWrite {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,

    #[argh(option, short = 'a', description = "start address")]
    pub address: Address,

    #[argh(option, short = 'd', description = "bytes to write, in hex")]
    pub data: HexBytes,

    #[argh(option, description = "protection to apply while writing, restored afterwards")]
    pub prot: Option<Protection>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "protect", description = "change page protection")]
pub struct SubCommandProtect {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,

    #[argh(option, short = 'a', description = "start address")]
    pub address: Address,

    #[argh(option, short = 's', description = "number of bytes")]
    pub size: Address,

    #[argh(option, description = "new protection, e.g. rw- or 3")]
    pub prot: Protection,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "main-binary", description = "find the main executable header")]
pub struct SubCommandMainBinary {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "image", description = "describe the image at an address")]
pub struct SubCommandImage {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,

    #[argh(option, short = 'a', description = "header address, defaults to the main binary")]
    pub address: Option<Address>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "slide", description = "print the aslr offset of the main executable")]
pub struct SubCommandSlide {
    #[argh(option, short = 'p', description = "process id, defaults to self")]
    pub pid: Option<Pid>,
}

#[test]
fn test_parse_address() {
    assert_eq!(Address::from_arg_value("0x1000").unwrap().0, 0x1000);
    assert_eq!(Address::from_arg_value("0X1_0000_0000").unwrap().0, 0x1_0000_0000);
    assert_eq!(Address::from_arg_value("4096").unwrap().0, 4096);
    assert!(Address::from_arg_value("0xzz").is_err());
}

#[test]
fn test_parse_hex_bytes() {
    assert_eq!(HexBytes::from_arg_value("deadBEEF").unwrap().0, [0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(HexBytes::from_arg_value("0x90 90").unwrap().0, [0x90, 0x90]);
    assert!(HexBytes::from_arg_value("abc").is_err());
    assert!(HexBytes::from_arg_value("").is_err());
    assert!(HexBytes::from_arg_value("zz").is_err());
}
