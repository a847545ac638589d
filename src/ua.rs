//! User agent classification.
//!
//! The installer population is open-ended, so recognition is an ordered list
//! of independent matchers rather than one grand regex; the first matcher to
//! claim a string wins. New installers get a new entry, existing entries stay
//! untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Structured sub-record
// ---------------------------------------------------------------------------

/// The parsed user agent, shaped after the JSON payload modern pip sends.
/// Every field is optional; recognizers fill in what their installer exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer: Option<Installer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implementation: Option<Implementation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distro: Option<Distro>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<System>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub openssl_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setuptools_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distro {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub libc: Option<Libc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Libc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lib: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct System {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
}

impl UserAgent {
    /// The record used when no recognizer matched; the caller keeps the raw
    /// string alongside it.
    pub fn unknown() -> Self {
        UserAgent {
            installer: Some(Installer {
                name: Some("unknown".to_owned()),
                version: None,
            }),
            ..UserAgent::default()
        }
    }

    fn installer(name: &str, version: Option<&str>) -> Self {
        UserAgent {
            installer: Some(Installer {
                name: Some(name.to_owned()),
                version: version.map(str::to_owned),
            }),
            ..UserAgent::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Recognizer chain
// ---------------------------------------------------------------------------

type Recognizer = fn(&str) -> Option<UserAgent>;

// Ordered: most specific first, browsers and bare HTTP libraries last.
const RECOGNIZERS: &[Recognizer] = &[
    pip_json,
    pip_legacy,
    uv,
    pex,
    bandersnatch,
    devpi,
    z3c_pypimirror,
    artifactory,
    nexus,
    pep381client,
    conda,
    homebrew,
    os_packager,
    setuptools,
    urllib_with_setuptools,
    requests,
    python_urllib,
    browser,
];

/// Classify a user agent string. `None` means no recognizer matched and the
/// event should carry the raw string with installer family `"unknown"`.
pub fn classify(user_agent: &str) -> Option<UserAgent> {
    RECOGNIZERS.iter().find_map(|recognize| recognize(user_agent))
}

// pip >= 6 appends a JSON document describing the whole environment:
// `pip/23.0 {"installer":{"name":"pip","version":"23.0"},...}`
fn pip_json(ua: &str) -> Option<UserAgent> {
    let rest = ua.strip_prefix("pip/")?;
    let (version, payload) = rest.split_once(' ')?;
    if !payload.starts_with('{') {
        return None;
    }
    let mut parsed: UserAgent = serde_json::from_str(payload).ok()?;
    if parsed.installer.is_none() {
        parsed.installer = Some(Installer {
            name: Some("pip".to_owned()),
            version: Some(version.to_owned()),
        });
    }
    Some(parsed)
}

static PIP_LEGACY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^pip/(?P<version>\S+) (?P<impl_name>\S+)/(?P<impl_version>\S+)(?: (?P<system>\S+)/(?P<release>\S+))?$",
    )
    .unwrap()
});

// pip 1.4 - 5.x: `pip/1.5.1 CPython/2.7.6 Linux/3.13.0-generic`
fn pip_legacy(ua: &str) -> Option<UserAgent> {
    let caps = PIP_LEGACY.captures(ua)?;
    let impl_name = caps["impl_name"].to_owned();
    let impl_version = caps["impl_version"].to_owned();
    Some(UserAgent {
        python: (impl_name == "CPython").then(|| impl_version.clone()),
        implementation: Some(Implementation {
            name: Some(impl_name),
            version: Some(impl_version),
        }),
        system: caps.name("system").map(|s| System {
            name: Some(s.as_str().to_owned()),
            release: caps.name("release").map(|r| r.as_str().to_owned()),
        }),
        ..UserAgent::installer("pip", Some(&caps["version"]))
    })
}

static UV: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^uv/(?P<version>\S+)").unwrap());

fn uv(ua: &str) -> Option<UserAgent> {
    let caps = UV.captures(ua)?;
    Some(UserAgent::installer("uv", Some(&caps["version"])))
}

static PEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^pex/(?P<version>\S+)").unwrap());

fn pex(ua: &str) -> Option<UserAgent> {
    let caps = PEX.captures(ua)?;
    Some(UserAgent::installer("pex", Some(&caps["version"])))
}

static BANDERSNATCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^bandersnatch/(?P<version>\S+)(?: \((?P<impl_name>\S+) (?P<impl_version>[^,]+), (?P<system>\S+) (?P<cpu>\S+)\))?$",
    )
    .unwrap()
});

// `bandersnatch/1.1 (cpython 3.4.1-final0, Linux x86_64)`
fn bandersnatch(ua: &str) -> Option<UserAgent> {
    let caps = BANDERSNATCH.captures(ua)?;
    Some(UserAgent {
        implementation: caps.name("impl_name").map(|n| Implementation {
            name: Some(n.as_str().to_owned()),
            version: caps.name("impl_version").map(|v| v.as_str().to_owned()),
        }),
        system: caps.name("system").map(|s| System {
            name: Some(s.as_str().to_owned()),
            release: None,
        }),
        cpu: caps.name("cpu").map(|c| c.as_str().to_owned()),
        ..UserAgent::installer("bandersnatch", Some(&caps["version"]))
    })
}

static DEVPI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^devpi-server/(?P<version>\S+)").unwrap());

fn devpi(ua: &str) -> Option<UserAgent> {
    let caps = DEVPI.captures(ua)?;
    Some(UserAgent::installer("devpi", Some(&caps["version"])))
}

static Z3C_PYPIMIRROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^z3c\.pypimirror/(?P<version>\S+)").unwrap());

fn z3c_pypimirror(ua: &str) -> Option<UserAgent> {
    let caps = Z3C_PYPIMIRROR.captures(ua)?;
    Some(UserAgent::installer("z3c.pypimirror", Some(&caps["version"])))
}

static ARTIFACTORY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Artifactory/(?P<version>\S+)").unwrap());

fn artifactory(ua: &str) -> Option<UserAgent> {
    let caps = ARTIFACTORY.captures(ua)?;
    Some(UserAgent::installer("Artifactory", Some(&caps["version"])))
}

static NEXUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Nexus/(?P<version>\S+)").unwrap());

fn nexus(ua: &str) -> Option<UserAgent> {
    let caps = NEXUS.captures(ua)?;
    Some(UserAgent::installer("Nexus", Some(&caps["version"])))
}

static PEP381CLIENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^pep381client(?:-proxy)?/(?P<version>\S+)").unwrap());

fn pep381client(ua: &str) -> Option<UserAgent> {
    let caps = PEP381CLIENT.captures(ua)?;
    Some(UserAgent::installer("pep381client", Some(&caps["version"])))
}

static CONDA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^conda/(?P<version>\S+)").unwrap());

fn conda(ua: &str) -> Option<UserAgent> {
    let caps = CONDA.captures(ua)?;
    Some(UserAgent::installer("conda", Some(&caps["version"])))
}

static HOMEBREW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Homebrew/(?P<version>\S+)").unwrap());

fn homebrew(ua: &str) -> Option<UserAgent> {
    let caps = HOMEBREW.captures(ua)?;
    Some(UserAgent::installer("Homebrew", Some(&caps["version"])))
}

static APT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Debian APT-HTTP/\S+(?: \((?P<version>[^)\s]+)\))?$").unwrap()
});
static YUM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^urlgrabber/\S+ yum/(?P<version>\S+)$").unwrap());
static DNF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^libdnf(?:/(?P<version>\S+))?(?: \((?P<distro>[^;)]+)(?:;[^)]*)?\))?$").unwrap()
});

// Distribution package managers fetching straight from the CDN:
// `Debian APT-HTTP/1.3 (1.2.24)`, `urlgrabber/3.10 yum/3.4.3`,
// `libdnf/0.55.0 (CentOS Linux 8; generic; Linux.x86_64)`.
fn os_packager(ua: &str) -> Option<UserAgent> {
    if let Some(caps) = APT.captures(ua) {
        return Some(UserAgent {
            distro: Some(Distro {
                name: Some("Debian".to_owned()),
                ..Distro::default()
            }),
            ..UserAgent::installer("apt", caps.name("version").map(|v| v.as_str()))
        });
    }
    if let Some(caps) = YUM.captures(ua) {
        return Some(UserAgent::installer("yum", Some(&caps["version"])));
    }
    if let Some(caps) = DNF.captures(ua) {
        return Some(UserAgent {
            distro: caps.name("distro").map(|d| Distro {
                name: Some(d.as_str().to_owned()),
                ..Distro::default()
            }),
            ..UserAgent::installer("dnf", caps.name("version").map(|v| v.as_str()))
        });
    }
    None
}

static SETUPTOOLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^setuptools/(?P<version>\S+)").unwrap());

fn setuptools(ua: &str) -> Option<UserAgent> {
    let caps = SETUPTOOLS.captures(ua)?;
    Some(UserAgent {
        setuptools_version: Some(caps["version"].to_owned()),
        ..UserAgent::installer("setuptools", Some(&caps["version"]))
    })
}

static URLLIB_SETUPTOOLS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Python-urllib/(?P<python>\S+) setuptools/(?P<version>\S+)$").unwrap()
});

// easy_install routes through urllib with a setuptools marker appended.
fn urllib_with_setuptools(ua: &str) -> Option<UserAgent> {
    let caps = URLLIB_SETUPTOOLS.captures(ua)?;
    Some(UserAgent {
        python: Some(caps["python"].to_owned()),
        setuptools_version: Some(caps["version"].to_owned()),
        ..UserAgent::installer("setuptools", Some(&caps["version"]))
    })
}

static REQUESTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^python-requests/(?P<version>\S+)").unwrap());

fn requests(ua: &str) -> Option<UserAgent> {
    let caps = REQUESTS.captures(ua)?;
    Some(UserAgent::installer("requests", Some(&caps["version"])))
}

static PYTHON_URLLIB: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Python-urllib/(?P<python>\S+)$").unwrap());

fn python_urllib(ua: &str) -> Option<UserAgent> {
    let caps = PYTHON_URLLIB.captures(ua)?;
    Some(UserAgent {
        python: Some(caps["python"].to_owned()),
        ..UserAgent::installer("distutils", None)
    })
}

const BROWSER_PREFIXES: &[&str] = &["Mozilla/", "Opera/", "Links ", "Lynx/"];

fn browser(ua: &str) -> Option<UserAgent> {
    BROWSER_PREFIXES
        .iter()
        .any(|prefix| ua.starts_with(prefix))
        .then(|| UserAgent::installer("Browser", None))
}
