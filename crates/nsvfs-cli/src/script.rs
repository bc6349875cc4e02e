//! Line scripts driving a [`Task`].
//!
//! One syscall-style command per line. Each command produces one line of
//! output: `ok`, a result, or the errno name the call failed with.
//!
//! ```text
//! mkdir /foo 0755
//! open /foo/file rdwr|creat 0644      # fd 0
//! write 0 hello\0
//! unlink /foo/file
//! fstat 0                             # regular mode=0644 size=6 nlink=0 ...
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use nsvfs_config::{log_cli_debug, log_cli_info, Config};
use nsvfs_core::task::{
    AT_EMPTY_PATH, AT_FDCWD, AT_REMOVEDIR, O_CREAT, O_DIRECTORY, O_EXCL, O_RDONLY, O_RDWR, O_TRUNC,
    O_WRONLY,
};
use nsvfs_core::{Credentials, Metadata, ObjectKind, Task, Vfs, VfsError, VfsOptions};
use nsvfs_snapshot::{SnapshotError, SnapshotOptions, VfsImage};

/// Largest buffer a single `read` or `pread` line may ask for
const MAX_READ: usize = 1 << 20;

pub struct ScriptRunner {
    task: Task,
    snapshot: SnapshotOptions,
    image_dir: PathBuf,
}

impl ScriptRunner {
    /// Runner over a fresh filesystem built from `config`
    pub fn new(config: &Config, cred: Credentials) -> Result<Self> {
        let vfs = Vfs::new(VfsOptions::from(config));
        let task = Task::new(Arc::new(vfs), cred)?;
        Ok(Self {
            task,
            snapshot: SnapshotOptions::from(&config.snapshot),
            image_dir: expand_home(&config.snapshot.image_dir),
        })
    }

    /// Run every line, collecting one output line per command
    pub fn run(&mut self, script: &str) -> Result<Vec<String>> {
        let mut output = Vec::new();
        for (n, line) in script.lines().enumerate() {
            let result = self
                .run_line(line)
                .with_context(|| format!("line {}: {}", n + 1, line.trim()))?;
            output.extend(result);
        }
        Ok(output)
    }

    /// Run a single line. Blank lines and comments produce no output.
    pub fn run_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = strip_comment(line).trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (command, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(c, r)| (c, r.trim_start()));
        log_cli_debug!("Script command", command = command);

        match self.dispatch(command, rest) {
            Ok(out) => Ok(Some(out)),
            Err(e) => match errno_of(&e) {
                Some(errno) => Ok(Some(errno.name().to_string())),
                None => match e.downcast_ref::<SnapshotError>() {
                    Some(SnapshotError::OrphansUnsupported { .. }) => Ok(Some(format!("error: {}", e))),
                    _ => Err(e),
                },
            },
        }
    }

    fn dispatch(&mut self, command: &str, rest: &str) -> Result<String> {
        let args: Vec<&str> = rest.split_whitespace().map(unquote).collect();
        match command {
            "mkdir" => {
                let mode = parse_mode(args.get(1).copied().unwrap_or("0777"))?;
                self.with_path(arg(&args, 0)?, |t, p| t.mkdir(p, mode))?;
                Ok("ok".into())
            }
            "open" => {
                let flags = parse_open_flags(arg(&args, 1)?)?;
                let mode = parse_mode(args.get(2).copied().unwrap_or("0666"))?;
                let fd = self.with_path(arg(&args, 0)?, |t, p| t.open(p, flags, mode))?;
                Ok(format!("fd {}", fd))
            }
            "write" => {
                let (fd, text) = rest
                    .split_once(char::is_whitespace)
                    .map_or((rest, ""), |(fd, text)| (fd, text.trim_start()));
                let n = self.task.write(parse_fd(fd)?, &unescape(text))?;
                Ok(format!("wrote {}", n))
            }
            "read" => {
                let mut buf = vec![0u8; parse_count(arg(&args, 1)?)?];
                let n = self.task.read(parse_fd(arg(&args, 0)?)?, &mut buf)?;
                Ok(escape(&buf[..n]))
            }
            "pread" => {
                let mut buf = vec![0u8; parse_count(arg(&args, 1)?)?];
                let offset = parse_offset(arg(&args, 2)?)?;
                let n = self.task.pread(parse_fd(arg(&args, 0)?)?, &mut buf, offset)?;
                Ok(escape(&buf[..n]))
            }
            "close" => {
                self.task.close(parse_fd(arg(&args, 0)?)?)?;
                Ok("ok".into())
            }
            "unlink" => {
                self.with_path(arg(&args, 0)?, |t, p| t.unlink(p))?;
                Ok("ok".into())
            }
            "rmdir" => {
                self.with_path(arg(&args, 0)?, |t, p| t.rmdir(p))?;
                Ok("ok".into())
            }
            "unlinkat" => {
                let dirfd = match arg(&args, 0)? {
                    "cwd" => AT_FDCWD,
                    fd => parse_fd(fd)?,
                };
                let flags = match args.get(2) {
                    Some(f) => parse_at_flags(f)?,
                    None => 0,
                };
                self.with_path(arg(&args, 1)?, |t, p| t.unlinkat(dirfd, p, flags))?;
                Ok("ok".into())
            }
            "chmod" => {
                let mode = parse_mode(arg(&args, 1)?)?;
                self.with_path(arg(&args, 0)?, |t, p| t.chmod(p, mode))?;
                Ok("ok".into())
            }
            "ftruncate" => {
                let len = parse_offset(arg(&args, 1)?)?;
                self.task.ftruncate(parse_fd(arg(&args, 0)?)?, len)?;
                Ok("ok".into())
            }
            "fchmod" => {
                let mode = parse_mode(arg(&args, 1)?)?;
                self.task.fchmod(parse_fd(arg(&args, 0)?)?, mode)?;
                Ok("ok".into())
            }
            "chdir" => {
                self.with_path(arg(&args, 0)?, |t, p| t.chdir(p))?;
                Ok("ok".into())
            }
            "stat" => {
                let meta = self.with_path(arg(&args, 0)?, |t, p| t.stat(p))?;
                Ok(format_metadata(&meta))
            }
            "fstat" => Ok(format_metadata(&self.task.fstat(parse_fd(arg(&args, 0)?)?)?)),
            "checkpoint" => {
                let path = self.image_path(arg(&args, 0)?);
                self.checkpoint(&path)
            }
            "restore" => {
                let path = self.image_path(arg(&args, 0)?);
                self.restore(&path)
            }
            other => bail!("unknown command '{}'", other),
        }
    }

    /// Copy `path` into the task's memory for the duration of `op`
    fn with_path<T>(
        &self,
        path: &str,
        op: impl FnOnce(&Task, u64) -> nsvfs_core::Result<T>,
    ) -> nsvfs_core::Result<T> {
        let memory = self.task.memory();
        let addr = memory.map_str(path);
        let result = op(&self.task, addr);
        memory.unmap(addr);
        result
    }

    fn checkpoint(&self, path: &Path) -> Result<String> {
        let image = {
            let frozen = self.task.vfs().freeze();
            VfsImage::capture(&frozen, &self.snapshot)?
        };
        image.save(path)?;
        let summary = image.summary();
        log_cli_info!("Checkpoint written", path = %path.display(), orphans = summary.orphans);
        Ok(format!(
            "saved {} objects, {} orphans, {} handles",
            summary.objects, summary.orphans, summary.handles
        ))
    }

    fn restore(&mut self, path: &Path) -> Result<String> {
        let options = *self.task.vfs().options();
        let vfs = VfsImage::load(path)?.restore(options)?;
        self.task.rebind(Arc::new(vfs))?;
        log_cli_info!("Checkpoint restored", path = %path.display());
        Ok("ok".into())
    }

    fn image_path(&self, name: &str) -> PathBuf {
        let path = expand_home(Path::new(name));
        if path.is_absolute() {
            path
        } else {
            self.image_dir.join(path)
        }
    }
}

/// Filesystem error behind a command failure, if any
fn errno_of(err: &anyhow::Error) -> Option<VfsError> {
    if let Some(e) = err.downcast_ref::<VfsError>() {
        return Some(*e);
    }
    match err.downcast_ref::<SnapshotError>() {
        Some(SnapshotError::Vfs(e)) => Some(*e),
        _ => None,
    }
}

fn strip_comment(line: &str) -> &str {
    line.split_once('#').map_or(line, |(code, _)| code)
}

/// `""` stands for the empty path
fn unquote(token: &str) -> &str {
    if token == "\"\"" {
        ""
    } else {
        token
    }
}

fn arg<'a>(args: &[&'a str], i: usize) -> Result<&'a str> {
    args.get(i)
        .copied()
        .ok_or_else(|| anyhow!("missing argument {}", i + 1))
}

fn parse_fd(s: &str) -> Result<i32> {
    s.parse().with_context(|| format!("bad descriptor '{}'", s))
}

fn parse_num(s: &str) -> Result<usize> {
    s.parse().with_context(|| format!("bad number '{}'", s))
}

fn parse_offset(s: &str) -> Result<u64> {
    s.parse().with_context(|| format!("bad offset '{}'", s))
}

/// Byte count for `read`/`pread`, bounded by [`MAX_READ`]
fn parse_count(s: &str) -> Result<usize> {
    let count = parse_num(s)?;
    if count > MAX_READ {
        bail!("read count {} exceeds {}", count, MAX_READ);
    }
    Ok(count)
}

fn parse_mode(s: &str) -> Result<u32> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8).with_context(|| format!("bad mode '{}'", s))
}

fn parse_open_flags(s: &str) -> Result<i32> {
    s.split('|').try_fold(0, |acc, flag| {
        let bit = match flag {
            "rdonly" => O_RDONLY,
            "wronly" => O_WRONLY,
            "rdwr" => O_RDWR,
            "creat" => O_CREAT,
            "excl" => O_EXCL,
            "trunc" => O_TRUNC,
            "directory" => O_DIRECTORY,
            other => bail!("unknown open flag '{}'", other),
        };
        Ok(acc | bit)
    })
}

fn parse_at_flags(s: &str) -> Result<i32> {
    s.split('|').try_fold(0, |acc, flag| {
        let bit = match flag {
            "removedir" => AT_REMOVEDIR,
            "empty_path" => AT_EMPTY_PATH,
            other => bail!("unknown at flag '{}'", other),
        };
        Ok(acc | bit)
    })
}

fn format_metadata(meta: &Metadata) -> String {
    let kind = match meta.kind {
        ObjectKind::Regular => "regular",
        ObjectKind::Directory => "directory",
    };
    format!(
        "{} mode={:04o} size={} nlink={} ino={}",
        kind,
        meta.mode & 0o7777,
        meta.size,
        meta.nlink,
        meta.id.ino()
    )
}

fn unescape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('0') => out.push(0),
            Some('n') => out.push(b'\n'),
            Some('\\') | None => out.push(b'\\'),
            Some(other) => {
                out.push(b'\\');
                let mut buf = [0u8; 4];
                out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
    out
}

fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            0 => out.push_str("\\0"),
            b'\n' => out.push_str("\\n"),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScriptRunner {
        ScriptRunner::new(&Config::default(), Credentials::root()).unwrap()
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let mut r = runner();
        assert_eq!(r.run_line("").unwrap(), None);
        assert_eq!(r.run_line("   # just a note").unwrap(), None);
        assert_eq!(r.run_line("mkdir /a # trailing").unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn test_errno_names_are_printed() {
        let mut r = runner();
        let out = r
            .run("mkdir /d\nunlink /d\nrmdir /missing\nrmdir /\nunlink \"\"\n")
            .unwrap();
        assert_eq!(out, vec!["ok", "EISDIR", "ENOENT", "EBUSY", "ENOENT"]);
    }

    #[test]
    fn test_orphan_stays_readable() {
        let mut r = runner();
        let out = r
            .run(
                "open /f rdwr|creat 0644\n\
                 write 0 hello\\0\n\
                 unlink /f\n\
                 pread 0 16 0\n\
                 fstat 0\n\
                 stat /f\n",
            )
            .unwrap();
        assert_eq!(out[0], "fd 0");
        assert_eq!(out[1], "wrote 6");
        assert_eq!(out[2], "ok");
        assert_eq!(out[3], "hello\\0");
        assert!(out[4].starts_with("regular mode=0644 size=6 nlink=0"));
        assert_eq!(out[5], "ENOENT");
    }

    #[test]
    fn test_unlinkat_flags() {
        let mut r = runner();
        let out = r
            .run(
                "mkdir /d\n\
                 unlinkat cwd d\n\
                 unlinkat cwd d removedir\n\
                 unlinkat cwd d removedir\n",
            )
            .unwrap();
        assert_eq!(out, vec!["ok", "EISDIR", "ok", "ENOENT"]);
    }

    #[test]
    fn test_malformed_lines_are_errors() {
        let mut r = runner();
        assert!(r.run_line("frobnicate /x").is_err());
        assert!(r.run_line("open /x sideways").is_err());
        assert!(r.run_line("close").is_err());
        assert!(r.run_line("mkdir /x 0999").is_err());
        assert!(r.run_line("ftruncate 0 -1").is_err());

        let err = r.run("mkdir /ok\nbogus\n").unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_huge_read_counts_are_rejected() {
        let mut r = runner();
        let out = r
            .run("open /f rdwr|creat\nwrite 0 abc\nftruncate 0 5\npread 0 16 0\n")
            .unwrap();
        assert_eq!(out, ["fd 0", "wrote 3", "ok", "abc\\0\\0"]);

        let err = r.run_line("read 0 99999999999999").unwrap_err();
        assert!(format!("{:#}", err).contains("exceeds"));
        assert!(r.run_line("pread 0 18446744073709551615 0").is_err());
        assert_eq!(r.run_line(&format!("pread 0 {} 0", MAX_READ)).unwrap().unwrap(), "abc\\0\\0");
        assert_eq!(r.run_line("ftruncate 0 18446744073709551615").unwrap().unwrap(), "EFBIG");
    }

    #[test]
    fn test_checkpoint_round_trip_through_script() {
        let env = nsvfs_config::testing::TestEnvironment::new().unwrap();
        let image = env.image_path("script");
        let image = image.display();
        let mut r = runner();
        let out = r
            .run(&format!(
                "open /f rdwr|creat\n\
                 write 0 data\n\
                 unlink /f\n\
                 checkpoint {image}\n\
                 restore {image}\n\
                 pread 0 4 0\n"
            ))
            .unwrap();
        assert_eq!(out[3], "saved 1 objects, 1 orphans, 2 handles");
        assert_eq!(out[4], "ok");
        assert_eq!(out[5], "data");
    }

    #[test]
    fn test_orphans_refused_by_config() {
        let mut config = Config::default();
        config.snapshot.save_orphans = false;
        let mut r = ScriptRunner::new(&config, Credentials::root()).unwrap();
        let out = r
            .run("open /f rdwr|creat\nunlink /f\ncheckpoint /nonexistent/never-written.img\n")
            .unwrap();
        assert!(out[2].starts_with("error:"));
    }

    #[test]
    fn test_escape_round_trip_of_specials() {
        assert_eq!(unescape("a\\0b\\nc\\\\"), b"a\0b\nc\\");
        assert_eq!(escape(b"a\0b\nc\\\x01"), "a\\0b\\nc\\\\\\x01");
    }

    #[test]
    fn test_relative_images_land_in_image_dir() {
        let mut config = Config::default();
        config.snapshot.image_dir = PathBuf::from("/var/images");
        let r = ScriptRunner::new(&config, Credentials::root()).unwrap();
        assert_eq!(r.image_path("a.img"), PathBuf::from("/var/images/a.img"));
        assert_eq!(r.image_path("/tmp/b.img"), PathBuf::from("/tmp/b.img"));
    }
}
