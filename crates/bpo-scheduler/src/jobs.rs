//! Task scripts of the jobs the scheduler dispatches.
//!
//! The setup task is added by the scheduler, since it depends on the
//! backend. Backends without polling get a final `submit` task that uploads
//! the results through the job callbacks.

use bpo_core::job::shell_quote as quote;
use bpo_core::report;
use bpo_core::{BranchArch, Image, JobTasks, Package, Push};

pub const BUILD_PACKAGE: &str = "build_package";
pub const GET_DEPENDS: &str = "get_depends";
pub const BUILD_IMAGE: &str = "build_image";

/// Directory below the pmbootstrap work dir holding the packages of a branch.
fn channel(branch: &str) -> &str {
    match branch {
        "master" => "edge",
        other => other,
    }
}

/// Variables read by the pmaports `submit.py` helper.
#[derive(Debug, Default)]
struct Submit<'a> {
    endpoint: &'a str,
    arch: &'a str,
    branch: &'a str,
    pkgname: &'a str,
    version: &'a str,
    push_id: Option<i64>,
    dir_name: &'a str,
    /// Shell expression expanding to the newline separated payload files.
    payload_files: &'a str,
    payload_is_json: bool,
}

impl Submit<'_> {
    fn script(&self) -> String {
        let push_id = self.push_id.map(|id| id.to_string()).unwrap_or_default();
        format!(
            r#"
            export BPO_API_ENDPOINT={}
            export BPO_ARCH={}
            export BPO_BRANCH={}
            export BPO_DIR_NAME={}
            export BPO_PAYLOAD_FILES="{}"
            export BPO_PAYLOAD_IS_JSON="{}"
            export BPO_PKGNAME={}
            export BPO_PUSH_ID={}
            export BPO_VERSION={}

            pmaports/.build.postmarketos.org/submit.py
            "#,
            quote(self.endpoint),
            quote(self.arch),
            quote(self.branch),
            quote(self.dir_name),
            self.payload_files,
            if self.payload_is_json { 1 } else { 0 },
            quote(self.pkgname),
            quote(&push_id),
            quote(self.version),
        )
    }
}

/// Build one package and leave its apks in the output dir.
pub fn build_package(package: &Package, submit: bool) -> JobTasks {
    let arch = quote(&package.arch);
    let pkgname = quote(&package.pkgname);
    let channel = quote(channel(&package.branch));

    let mut tasks = JobTasks::new();
    tasks.push(
        "pmbootstrap build",
        &format!(
            r#"
            ./pmbootstrap/pmbootstrap.py build \
                --no-depends \
                --strict \
                --arch {arch} \
                {pkgname}
            cp "$(./pmbootstrap/pmbootstrap.py -q config work)"/packages/{channel}/{arch}/*.apk \
                "$BPO_OUTPUT_DIR"/
            "#
        ),
    );

    if submit {
        let script = Submit {
            endpoint: "build-package",
            arch: &package.arch,
            branch: &package.branch,
            pkgname: &package.pkgname,
            version: &package.version,
            payload_files: r#"$(ls -1 "$BPO_OUTPUT_DIR"/*.apk)"#,
            ..Default::default()
        }
        .script();
        tasks.push("submit", &script);
    }
    tasks
}

/// Ask pmbootstrap which packages are missing from the binary repository,
/// once per architecture of the pushed branch.
pub fn get_depends(push: &Push, keys: &[BranchArch], submit: bool) -> JobTasks {
    let mut script = String::new();
    for key in keys {
        script.push_str(&format!(
            "./pmbootstrap/pmbootstrap.py repo_missing --arch {} --built > \"$BPO_OUTPUT_DIR\"/{}\n",
            quote(&key.arch),
            quote(&report::file_name(key)),
        ));
    }

    let mut tasks = JobTasks::new();
    tasks.push("pmbootstrap repo_missing", &script);

    if submit {
        let script = Submit {
            endpoint: "get-depends",
            branch: &push.branch,
            push_id: Some(push.id),
            payload_files: r#"$(ls -1 "$BPO_OUTPUT_DIR"/depends.*.json)"#,
            payload_is_json: true,
            ..Default::default()
        }
        .script();
        tasks.push("submit", &script);
    }
    tasks
}

/// Build and export one image into `$BPO_OUTPUT_DIR/<dir_name>`.
pub fn build_image(image: &Image, dir_name: &str, submit: bool) -> JobTasks {
    let device = quote(&image.device);
    let ui = quote(&image.ui);
    let dir = quote(dir_name);

    let mut tasks = JobTasks::new();
    tasks.push(
        "pmbootstrap install",
        &format!(
            r#"
            ./pmbootstrap/pmbootstrap.py config device {device}
            ./pmbootstrap/pmbootstrap.py config ui {ui}
            ./pmbootstrap/pmbootstrap.py -y zap -p
            ./pmbootstrap/pmbootstrap.py install --password 147147
            "#
        ),
    );
    tasks.push(
        "pmbootstrap export",
        &format!(
            r#"
            mkdir -p "$BPO_OUTPUT_DIR"/{dir}
            ./pmbootstrap/pmbootstrap.py export --no-install "$BPO_OUTPUT_DIR"/{dir}
            "#
        ),
    );

    if submit {
        let script = Submit {
            endpoint: "build-image",
            branch: &image.branch,
            dir_name,
            ..Default::default()
        }
        .script();
        tasks.push("submit", &script);
    }
    tasks
}
