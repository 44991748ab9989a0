//! Ordered line-matching rules for toolchain output.
//!
//! [`RULES`] is evaluated top to bottom and the first rule that recognises
//! a line decides its [`LineClass`]. Order matters: several later rules
//! would also match lines that an earlier rule claims (e.g. `RAM:` progress
//! bars versus the bare `RAM:` milestone).

use std::sync::LazyLock;

use regex::Regex;

pub const STARTING: &str = "Starting...";
pub const UPLOAD_SUCCEEDED: &str = "Upload Succeeded";
pub const BUILD_SUCCEEDED: &str = "Build Succeeded";
pub const BUILD_FAILED: &str = "Build Failed";
pub const AUTH_INVALID: &str = "Upload Failed: Authentication Invalid";
pub const HOST_NOT_FOUND: &str = "Upload Failed: Host not found";
pub const FINDING_DEVICE: &str = "Finding Device...";
pub const UPLOADING_FIRMWARE: &str = "Uploading Firmware";
pub const CREATING_BINARIES: &str = "Creating Final Binaries";
pub const CALCULATING_SIZE: &str = "Calculating Firmware Size";
pub const LINKING_FIRMWARE: &str = "Linking Firmware";
pub const LINKING_BOOTLOADER: &str = "Linking Bootloader";
pub const GENERATING_LINKER_SCRIPT: &str = "Generating Linker Script";
pub const INSTALLING_DEPENDENCIES: &str = "Installing Dependencies";
pub const GENERATING_CPP: &str = "Generating C++";
pub const INITIALIZING_PLATFORMIO: &str = "Initializing PlatformIO";
pub const VALIDATING_CONFIG: &str = "Validating Config";

/// Milestones whose triggering line is not echoed as a plain log line.
pub const SUPPRESSED_MILESTONES: [&str; 3] = [UPLOAD_SUCCEEDED, BUILD_SUCCEEDED, AUTH_INVALID];

static MEMORY_BAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(RAM|Flash):\s*(\[.*?\])\s*(\d+\.\d+%)").expect("valid regex")
});

static DOWNLOAD_BAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\?25l(Downloading|Unpacking)\s*(\[.*?\])\s*(\d+%)").expect("valid regex")
});

/// A progress bar recognised in a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub name: String,
    pub bar: String,
    pub percent: String,
}

impl ProgressLine {
    /// The milestone a progress quantity belongs under, if it has one.
    pub fn bucket(&self) -> Option<&'static str> {
        match self.name.as_str() {
            "RAM" | "Flash" => Some(CALCULATING_SIZE),
            "Downloading" | "Unpacking" => Some(INSTALLING_DEPENDENCIES),
            _ => None,
        }
    }
}

/// What a single raw line means for the viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineClass {
    Milestone(String),
    Progress(ProgressLine),
    /// One of many similar lines collapsed into a counted step.
    RepeatStep,
    Plain,
}

/// A named `(predicate, outcome)` pair.
pub struct Rule {
    pub name: &'static str,
    pub apply: fn(&str) -> Option<LineClass>,
}

fn milestone(name: &str) -> Option<LineClass> {
    Some(LineClass::Milestone(name.to_string()))
}

fn upload_succeeded(line: &str) -> Option<LineClass> {
    (line.contains("Successfully uploaded") || line.starts_with("===== [SUCCESS]"))
        .then(|| LineClass::Milestone(UPLOAD_SUCCEEDED.into()))
}

fn build_succeeded(line: &str) -> Option<LineClass> {
    (line.contains("[SUCCESS]") && line.contains("Successfully created"))
        .then(|| LineClass::Milestone(BUILD_SUCCEEDED.into()))
}

fn build_failed(line: &str) -> Option<LineClass> {
    let failed = line.contains("[FAILED]")
        || (line.contains("error") && line.contains("compilation terminated"))
        || line.starts_with("===== [FAILED]");
    failed.then(|| LineClass::Milestone(BUILD_FAILED.into()))
}

fn auth_invalid(line: &str) -> Option<LineClass> {
    (line.contains("ERROR") && line.contains("Authentication invalid"))
        .then(|| LineClass::Milestone(AUTH_INVALID.into()))
}

fn host_not_found(line: &str) -> Option<LineClass> {
    (line.contains("Error:") && line.contains("Could not find") && line.contains(".local"))
        .then(|| LineClass::Milestone(HOST_NOT_FOUND.into()))
}

fn connect_error(line: &str) -> Option<LineClass> {
    (line.contains("ERROR") && line.contains("Connecting to"))
        .then(|| LineClass::Milestone(format!("Upload Failed: {}", line.trim())))
}

fn generic_error(line: &str) -> Option<LineClass> {
    line.strip_prefix("Error:")
        .map(|rest| LineClass::Milestone(format!("Error: {}", rest.trim())))
}

fn progress_from(re: &Regex, line: &str) -> Option<LineClass> {
    let caps = re.captures(line)?;
    Some(LineClass::Progress(ProgressLine {
        name: caps[1].to_string(),
        bar: caps[2].to_string(),
        percent: caps[3].to_string(),
    }))
}

fn memory_bar(line: &str) -> Option<LineClass> {
    progress_from(&MEMORY_BAR_RE, line)
}

fn download_bar(line: &str) -> Option<LineClass> {
    progress_from(&DOWNLOAD_BAR_RE, line)
}

fn finding_device(line: &str) -> Option<LineClass> {
    line.contains("Looking for upload port...")
        .then(|| LineClass::Milestone(FINDING_DEVICE.into()))
}

fn uploading_firmware(line: &str) -> Option<LineClass> {
    (line.contains("Uploading") && line.contains(".bin"))
        .then(|| LineClass::Milestone(UPLOADING_FIRMWARE.into()))
}

fn connecting(line: &str) -> Option<LineClass> {
    line.contains("Connecting to")
        .then(|| LineClass::Milestone(line.trim().to_string()))
}

fn creating_binaries(line: &str) -> Option<LineClass> {
    let hit = line.contains("merging binaries into")
        || line.contains("esp32_copy_ota_bin")
        || (line.contains("Successfully created") && line.contains(".bin"));
    hit.then(|| LineClass::Milestone(CREATING_BINARIES.into()))
}

fn ram_summary(line: &str) -> Option<LineClass> {
    if line.starts_with("RAM:") {
        milestone(CALCULATING_SIZE)
    } else {
        None
    }
}

fn linking_firmware(line: &str) -> Option<LineClass> {
    (line.contains("Linking .pioenvs") && line.contains("firmware.elf"))
        .then(|| LineClass::Milestone(LINKING_FIRMWARE.into()))
}

fn linking_bootloader(line: &str) -> Option<LineClass> {
    (line.contains("Linking .pioenvs") && line.contains("bootloader.elf"))
        .then(|| LineClass::Milestone(LINKING_BOOTLOADER.into()))
}

fn linker_script(line: &str) -> Option<LineClass> {
    line.contains("Generating project linker script")
        .then(|| LineClass::Milestone(GENERATING_LINKER_SCRIPT.into()))
}

fn compile_or_archive(line: &str) -> Option<LineClass> {
    (line.contains("Compiling .pioenvs") || line.contains("Archiving .pioenvs"))
        .then_some(LineClass::RepeatStep)
}

fn installing_dependencies(line: &str) -> Option<LineClass> {
    let hit = ["scons:", "Platformio:", "NOTICE:", "Resolving"]
        .iter()
        .any(|needle| line.contains(needle))
        || [
            "Platform Manager: Installing",
            "Tool Manager: Installing",
            "Library Manager: Installing",
        ]
        .iter()
        .any(|prefix| line.starts_with(prefix));
    hit.then(|| LineClass::Milestone(INSTALLING_DEPENDENCIES.into()))
}

fn generating_cpp(line: &str) -> Option<LineClass> {
    line.contains("Generating C++ code")
        .then(|| LineClass::Milestone(GENERATING_CPP.into()))
}

fn initializing_platformio(line: &str) -> Option<LineClass> {
    (line.contains("Running: platformio") || line.contains("Initializing Platformio"))
        .then(|| LineClass::Milestone(INITIALIZING_PLATFORMIO.into()))
}

fn validating(line: &str) -> Option<LineClass> {
    line.contains("Validating")
        .then(|| LineClass::Milestone(VALIDATING_CONFIG.into()))
}

/// The rule table, in priority order.
pub static RULES: &[Rule] = &[
    Rule { name: "upload_succeeded", apply: upload_succeeded },
    Rule { name: "build_succeeded", apply: build_succeeded },
    Rule { name: "build_failed", apply: build_failed },
    Rule { name: "auth_invalid", apply: auth_invalid },
    Rule { name: "host_not_found", apply: host_not_found },
    Rule { name: "connect_error", apply: connect_error },
    Rule { name: "generic_error", apply: generic_error },
    Rule { name: "memory_bar", apply: memory_bar },
    Rule { name: "download_bar", apply: download_bar },
    Rule { name: "finding_device", apply: finding_device },
    Rule { name: "uploading_firmware", apply: uploading_firmware },
    Rule { name: "connecting", apply: connecting },
    Rule { name: "creating_binaries", apply: creating_binaries },
    Rule { name: "ram_summary", apply: ram_summary },
    Rule { name: "linking_firmware", apply: linking_firmware },
    Rule { name: "linking_bootloader", apply: linking_bootloader },
    Rule { name: "linker_script", apply: linker_script },
    Rule { name: "compile_or_archive", apply: compile_or_archive },
    Rule { name: "installing_dependencies", apply: installing_dependencies },
    Rule { name: "generating_cpp", apply: generating_cpp },
    Rule { name: "initializing_platformio", apply: initializing_platformio },
    Rule { name: "validating", apply: validating },
];

/// Classify one trimmed line. First match wins; unmatched lines are plain.
pub fn classify_line(line: &str) -> LineClass {
    RULES
        .iter()
        .find_map(|rule| (rule.apply)(line))
        .unwrap_or(LineClass::Plain)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
