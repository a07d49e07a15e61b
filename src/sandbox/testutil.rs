//! Scriptable stand-in for the isolate binary used by unit tests.
//!
//! Every test takes its own box IDs so the shared script state never clashes
//! across concurrently running tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

const SCRIPT: &str = r#"#!/bin/sh
ROOT='@ROOT@'
box=0
meta=
stdout=
mode=
for arg in "$@"; do
  case "$arg" in
    --box-id=*) box="${arg#--box-id=}" ;;
    --meta=*) meta="${arg#--meta=}" ;;
    --stdout=*) stdout="${arg#--stdout=}" ;;
    --init) mode=init ;;
    --cleanup) mode=cleanup ;;
    --version) mode=version ;;
    --run) mode=run; break ;;
  esac
done
state="$ROOT/state"
dir="$ROOT/boxes/$box"
case "$mode" in
  version)
    echo "The process isolator 2.0"
    echo "(c) 2012-2024 Martin Mares and Bernard Blackham"
    exit 0 ;;
  init)
    echo "init $*" >> "$state/calls-$box"
    replies="$state/init-replies-$box"
    if [ -s "$replies" ]; then
      head -n 1 "$replies" >&2
      tail -n +2 "$replies" > "$replies.tmp"
      mv "$replies.tmp" "$replies"
      exit 2
    fi
    mkdir -p "$dir/box"
    echo "$dir"
    exit 0 ;;
  cleanup)
    echo "cleanup $*" >> "$state/calls-$box"
    rm -rf "$dir"
    exit 0 ;;
  run)
    echo "run" >> "$state/calls-$box"
    printf '%s\n' "$@" > "$state/args-$box"
    if [ -f "$state/sleep-$box" ]; then
      sleep "$(cat "$state/sleep-$box")"
    fi
    if [ -f "$state/meta-$box" ]; then
      cp "$state/meta-$box" "$meta"
    else
      printf 'time:0.010\ntime-wall:0.020\ncg-mem:1024\nexitcode:0\n' > "$meta"
    fi
    if [ -n "$stdout" ] && [ "$stdout" != /dev/null ] && [ -f "$state/out-$box" ]; then
      cp "$state/out-$box" "$dir$stdout"
    fi
    if [ -f "$state/produce-$box" ]; then
      while read -r path; do
        printf 'binary' > "$dir$path"
      done < "$state/produce-$box"
    fi
    exit 0 ;;
esac
echo "unexpected invocation: $*" >&2
exit 2
"#;

static FAKE: OnceLock<FakeIsolate> = OnceLock::new();
static NEXT_BOX_ID: AtomicU32 = AtomicU32::new(100);

pub(crate) struct FakeIsolate {
    root: PathBuf,
    script: PathBuf,
}

impl FakeIsolate {
    /// The process-wide fake, installed on first use
    pub fn shared() -> &'static FakeIsolate {
        FAKE.get_or_init(|| {
            let root = std::env::temp_dir().join(format!("judge-eval-fake-isolate-{}", std::process::id()));
            let _ = fs::remove_dir_all(&root);
            fs::create_dir_all(root.join("state")).unwrap();
            fs::create_dir_all(root.join("boxes")).unwrap();

            let script = root.join("isolate");
            fs::write(&script, SCRIPT.replace("@ROOT@", &root.display().to_string())).unwrap();
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

            FakeIsolate { root, script }
        })
    }

    pub fn path(&self) -> &Path {
        &self.script
    }

    pub fn next_box_id(&self) -> u32 {
        NEXT_BOX_ID.fetch_add(1, Ordering::SeqCst)
    }

    /// Reserve `count` consecutive IDs; returns the start so that
    /// `start + 1 ..= start + count` belong to the caller
    pub fn reserve_boxes(&self, count: u32) -> u32 {
        NEXT_BOX_ID.fetch_add(count, Ordering::SeqCst) - 1
    }

    fn state(&self, name: &str, box_id: u32) -> PathBuf {
        self.root.join("state").join(format!("{}-{}", name, box_id))
    }

    /// Make the next `--init` calls fail with these messages, one per call
    pub fn queue_init_failures(&self, box_id: u32, messages: &[&str]) {
        let mut content = messages.join("\n");
        content.push('\n');
        fs::write(self.state("init-replies", box_id), content).unwrap();
    }

    /// Meta file content every run in this box reports
    pub fn set_meta(&self, box_id: u32, content: &str) {
        fs::write(self.state("meta", box_id), content).unwrap();
    }

    /// Content copied to the run's `--stdout` target
    pub fn set_output(&self, box_id: u32, content: &str) {
        fs::write(self.state("out", box_id), content).unwrap();
    }

    /// Sandbox paths each run creates, as a compiler would
    pub fn produce(&self, box_id: u32, paths: &[&str]) {
        let mut content = paths.join("\n");
        content.push('\n');
        fs::write(self.state("produce", box_id), content).unwrap();
    }

    /// Make runs hang for this many seconds before reporting
    pub fn set_sleep(&self, box_id: u32, secs: u32) {
        fs::write(self.state("sleep", box_id), secs.to_string()).unwrap();
    }

    pub fn calls(&self, box_id: u32) -> Vec<String> {
        fs::read_to_string(self.state("calls", box_id))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    pub fn run_count(&self, box_id: u32) -> usize {
        self.calls(box_id).iter().filter(|c| *c == "run").count()
    }

    /// Arguments of the most recent run, one per element
    pub fn last_run_args(&self, box_id: u32) -> Vec<String> {
        fs::read_to_string(self.state("args", box_id))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }
}
