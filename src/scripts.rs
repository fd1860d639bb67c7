//! PowerShell scripts shipped inside the package.
//!
//! All functions here are pure: the same [`CatalogEntry`] always renders to
//! byte-identical text. Writing the text into a workspace is the caller's job.

use crate::model::CatalogEntry;

pub const UNINSTALL_SCRIPT_NAME: &str = "uninstall.ps1";
pub const DETECTION_SCRIPT_NAME: &str = "detection.ps1";

const FALLBACK_SETUP_STEM: &str = "DefaultApp";

/// Locates winget on the target device. Intune runs scripts as SYSTEM, where
/// winget is not on `PATH`.
const RESOLVE_WINGET: &str = r#"$WingetPath = $null
$Resolved = Get-ChildItem "$env:ProgramFiles\WindowsApps\Microsoft.DesktopAppInstaller_*_x64__8wekyb3d8bbwe\winget.exe" -ErrorAction SilentlyContinue |
    Sort-Object FullName -Descending | Select-Object -First 1
if ($Resolved) {
    $WingetPath = $Resolved.FullName
} elseif (Test-Path "$env:LOCALAPPDATA\Microsoft\WindowsApps\winget.exe") {
    $WingetPath = "$env:LOCALAPPDATA\Microsoft\WindowsApps\winget.exe"
} else {
    Write-Output "winget executable not found"
    exit 1
}
"#;

const INSTALL_TEMPLATE: &str = r#"$ErrorActionPreference = 'Stop'
$ProgressPreference = 'SilentlyContinue'

$AppId = @APP_ID@
$AppName = @APP_NAME@
@RESOLVE_WINGET@
Write-Output "Installing $AppName ($AppId)"
& $WingetPath install --id $AppId @VERSION_ARGS@--exact --scope machine --silent --accept-package-agreements --accept-source-agreements --disable-interactivity
if ($LASTEXITCODE -ne 0) {
    Write-Output "winget install failed with exit code $LASTEXITCODE"
    exit $LASTEXITCODE
}
exit 0
"#;

const UNINSTALL_TEMPLATE: &str = r#"$ErrorActionPreference = 'Stop'
$ProgressPreference = 'SilentlyContinue'

$AppId = @APP_ID@
$AppName = @APP_NAME@
@RESOLVE_WINGET@
$Installed = & $WingetPath list --id $AppId --exact --accept-source-agreements | Out-String
if ($Installed -notmatch [regex]::Escape($AppId)) {
    Write-Output "$AppName ($AppId) is not installed"
    exit 0
}

Write-Output "Uninstalling $AppName ($AppId)"
& $WingetPath uninstall --id $AppId --exact --silent --accept-package-agreements --accept-source-agreements --disable-interactivity
if ($LASTEXITCODE -ne 0) {
    Write-Output "winget uninstall failed with exit code $LASTEXITCODE"
    exit $LASTEXITCODE
}
exit 0
"#;

// Intune treats "exit 0 with output on stdout" as detected and anything
// else as not detected, so nothing is written on the not-detected path.
const DETECTION_TEMPLATE: &str = r#"$ProgressPreference = 'SilentlyContinue'

$AppId = @APP_ID@
@RESOLVE_WINGET@
$Listing = & $WingetPath list --id $AppId --exact --accept-source-agreements 2>$null | Out-String
if ($LASTEXITCODE -eq 0 -and $Listing -match [regex]::Escape($AppId)) {
    Write-Output "Detected $AppId"
    exit 0
}
exit 1
"#;

pub fn install_script(entry: &CatalogEntry) -> String {
    let version_args = if entry.pins_version() {
        format!("--version {} ", ps_literal(&entry.version))
    } else {
        String::new()
    };
    render(INSTALL_TEMPLATE, entry, &version_args)
}

pub fn uninstall_script(entry: &CatalogEntry) -> String {
    render(UNINSTALL_TEMPLATE, entry, "")
}

pub fn detection_script(entry: &CatalogEntry) -> String {
    render(DETECTION_TEMPLATE, entry, "")
}

/// File name of the install script, which the packaging tool also uses to
/// name the artifact (`<stem>.intunewin`).
pub fn setup_file_name(entry: &CatalogEntry) -> String {
    let stem: String = entry
        .name
        .chars()
        .filter(|c| !c.is_whitespace() && !r#"\/:*?"<>|"#.contains(*c))
        .collect();
    let stem = stem.trim_matches(|c: char| !c.is_alphanumeric());
    let file_name = format!("{stem}.ps1");
    // Must not overwrite the companion scripts in the same directory.
    let reserved = [UNINSTALL_SCRIPT_NAME, DETECTION_SCRIPT_NAME]
        .iter()
        .any(|name| name.eq_ignore_ascii_case(&file_name));
    if stem.is_empty() || reserved {
        format!("{FALLBACK_SETUP_STEM}.ps1")
    } else {
        file_name
    }
}

/// Fills every placeholder in one left-to-right pass. Substituted text is
/// never scanned again, so values that look like placeholders stay verbatim.
fn render(template: &str, entry: &CatalogEntry, version_args: &str) -> String {
    let app_id = ps_literal(&entry.id);
    let app_name = ps_literal(&entry.name);
    let values = [
        ("@RESOLVE_WINGET@", RESOLVE_WINGET),
        ("@APP_ID@", app_id.as_str()),
        ("@APP_NAME@", app_name.as_str()),
        ("@VERSION_ARGS@", version_args),
    ];

    let mut out = String::with_capacity(template.len() + RESOLVE_WINGET.len());
    let mut rest = template;
    'scan: while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let tail = &rest[at..];
        for (placeholder, value) in values {
            if let Some(after) = tail.strip_prefix(placeholder) {
                out.push_str(value);
                rest = after;
                continue 'scan;
            }
        }
        out.push('@');
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}

/// Single-quoted PowerShell literal; no interpolation happens inside, and
/// embedded quotes are doubled.
fn ps_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seven_zip() -> CatalogEntry {
        CatalogEntry::new("7-Zip", "7zip.7zip", "24.08", "winget")
    }

    #[test]
    fn test_scripts_are_deterministic() {
        let entry = seven_zip();
        assert_eq!(install_script(&entry), install_script(&entry.clone()));
        assert_eq!(uninstall_script(&entry), uninstall_script(&entry.clone()));
        assert_eq!(detection_script(&entry), detection_script(&entry.clone()));
    }

    #[test]
    fn test_install_script_embeds_id_and_silent_flags() {
        let script = install_script(&seven_zip());

        assert!(script.contains("$AppId = '7zip.7zip'"));
        assert!(script.contains("install --id $AppId --version '24.08' --exact"));
        assert!(script.contains("--accept-package-agreements"));
        assert!(script.contains("--accept-source-agreements"));
        assert!(script.contains("--silent"));
        assert!(!script.contains('@'));
    }

    #[test]
    fn test_install_script_skips_unknown_version() {
        let entry = CatalogEntry::new("Tool", "Vendor.Tool", "Unknown", "winget");
        let script = install_script(&entry);
        assert!(!script.contains("--version"));
    }

    #[test]
    fn test_uninstall_script_flags() {
        let script = uninstall_script(&seven_zip());
        assert!(script.contains("uninstall --id $AppId"));
        assert!(script.contains("--accept-package-agreements"));
        assert!(script.contains("--silent"));
    }

    #[test]
    fn test_detection_script_lists_by_id() {
        let script = detection_script(&seven_zip());
        assert!(script.contains("list --id $AppId"));
        assert!(script.contains("exit 1"));
        assert!(script.contains("$AppId = '7zip.7zip'"));
    }

    #[test]
    fn test_values_cannot_break_out_of_literals() {
        let entry = CatalogEntry::new("O'Brien $(Remove-Item C:\\)", "Vendor.Tool", "1.0", "");
        let script = install_script(&entry);
        assert!(script.contains("$AppName = 'O''Brien $(Remove-Item C:\\)'"));
    }

    #[test]
    fn test_placeholder_text_in_values_is_not_expanded() {
        let entry = CatalogEntry::new("@APP_ID@", "Vendor.@APP_NAME@", "@VERSION_ARGS@", "");
        let script = install_script(&entry);

        assert!(script.contains("$AppId = 'Vendor.@APP_NAME@'"));
        assert!(script.contains("$AppName = '@APP_ID@'"));
        assert!(script.contains("--version '@VERSION_ARGS@' --exact"));
        assert!(!script.contains("@RESOLVE_WINGET@"));
    }

    #[test]
    fn test_setup_file_name_is_sanitized() {
        assert_eq!(setup_file_name(&seven_zip()), "7-Zip.ps1");
        let entry = CatalogEntry::new("Visual Studio Code: Insiders", "x", "1", "");
        assert_eq!(setup_file_name(&entry), "VisualStudioCodeInsiders.ps1");
        let entry = CatalogEntry::new("???", "x", "1", "");
        assert_eq!(setup_file_name(&entry), "DefaultApp.ps1");
    }

    #[test]
    fn test_setup_file_name_avoids_companion_scripts() {
        let entry = CatalogEntry::new("Uninstall", "x", "1", "");
        assert_eq!(setup_file_name(&entry), "DefaultApp.ps1");
    }
}
