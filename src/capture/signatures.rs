//! Static byte-pattern signatures for inbound payloads

/// How a signature recognizes a payload
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    /// ASCII case-insensitive substring
    Contains(&'static [u8]),
    /// At least `min_len` consecutive copies of `byte`
    Run { byte: u8, min_len: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct Signature {
    pub name: &'static str,
    pub matcher: Matcher,
}

pub const SIGNATURES: &[Signature] = &[
    Signature {
        name: "nop-sled",
        matcher: Matcher::Run { byte: 0x90, min_len: 100 },
    },
    Signature {
        name: "cmd-exec",
        matcher: Matcher::Contains(b"cmd.exe"),
    },
    Signature {
        name: "shell-exec",
        matcher: Matcher::Contains(b"/bin/sh"),
    },
    Signature {
        name: "bash-exec",
        matcher: Matcher::Contains(b"/bin/bash"),
    },
    Signature {
        name: "powershell",
        matcher: Matcher::Contains(b"powershell"),
    },
    Signature {
        name: "rootkit",
        matcher: Matcher::Contains(b"rootkit"),
    },
];

impl Signature {
    pub fn matches(&self, data: &[u8]) -> bool {
        match self.matcher {
            Matcher::Contains(needle) => contains_ignore_case(data, needle),
            Matcher::Run { byte, min_len } => longest_run(data, byte) >= min_len,
        }
    }
}

/// Names of every signature found in `data`
pub fn scan(data: &[u8]) -> Vec<&'static str> {
    SIGNATURES
        .iter()
        .filter(|sig| sig.matches(data))
        .map(|sig| sig.name)
        .collect()
}

fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack
        .windows(needle.len())
        .any(|window| window.eq_ignore_ascii_case(needle))
}

fn longest_run(data: &[u8], byte: u8) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for b in data {
        if *b == byte {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}
