//! Console log storage — per-server append log with size-triggered rotation
//! into gzip archives and retention pruning.
//!
//! 활성 파일은 `<working_dir>/logs/console.log`, 아카이브는
//! `<working_dir>/logs/archive/<YYYYMMDD-HHMMSS>.log.gz` 에 저장됩니다.

use anyhow::Result;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ConsoleLogConfig;

const ACTIVE_NAME: &str = "console.log";
const ARCHIVE_DIR: &str = "archive";

/// 한 서버의 회전 콘솔 로그.
///
/// append 핸들은 그 서버의 reader loop가 단독 소유합니다 — 다른 컴포넌트는
/// 이 타입을 통하지 않고 활성 파일에 쓰지 않습니다.
pub struct ConsoleLogFile {
    active_path: PathBuf,
    archive_dir: PathBuf,
    writer: Option<File>,
    size: u64,
    config: ConsoleLogConfig,
}

impl ConsoleLogFile {
    /// 서버 작업 디렉토리 아래에 로그 파일을 열거나 생성합니다.
    ///
    /// 기동 시점에 활성 파일이 이미 임계값을 넘어 있으면 먼저 회전합니다.
    pub fn open(working_dir: &Path, config: ConsoleLogConfig) -> Result<Self> {
        let log_dir = working_dir.join("logs");
        let archive_dir = log_dir.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_dir)?;

        let active_path = log_dir.join(ACTIVE_NAME);
        let size = fs::metadata(&active_path).map(|m| m.len()).unwrap_or(0);

        let mut log = Self {
            active_path,
            archive_dir,
            writer: None,
            size,
            config,
        };

        if log.size >= log.config.rotate_bytes {
            log.rotate()?;
        }
        log.reopen()?;
        Ok(log)
    }

    fn reopen(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_path)?;
        self.size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.writer = Some(file);
        Ok(())
    }

    /// 한 줄을 기록하고 flush한 뒤 회전 여부를 검사합니다.
    ///
    /// 회전을 유발한 줄은 회전 검사보다 먼저 완전히 기록됩니다.
    pub fn write_line(&mut self, text: &str) -> Result<()> {
        if self.writer.is_none() {
            self.reopen()?;
        }
        let writer = self.writer.as_mut().unwrap();
        writer.write_all(text.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        self.size += text.len() as u64 + 1;

        self.rotate_if_needed()
    }

    /// 활성 파일이 임계값 이상이면 회전합니다.
    pub fn rotate_if_needed(&mut self) -> Result<()> {
        if self.size >= self.config.rotate_bytes {
            self.rotate()?;
        }
        Ok(())
    }

    /// 활성 파일을 닫고 타임스탬프 이름으로 아카이브 디렉토리에 옮긴 뒤
    /// gzip 압축하고, 새 활성 파일을 열고, 보존 정책을 적용합니다.
    fn rotate(&mut self) -> Result<()> {
        self.writer = None;

        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let mut plain = self.archive_dir.join(format!("{}.log", stamp));
        let mut n = 1;
        while plain.exists() || plain.with_extension("log.gz").exists() {
            plain = self.archive_dir.join(format!("{}-{}.log", stamp, n));
            n += 1;
        }

        match fs::rename(&self.active_path, &plain) {
            Ok(()) => {
                if let Err(e) = compress_archive(&plain) {
                    // 압축 실패 시 비압축 아카이브라도 남긴다
                    tracing::warn!("Failed to compress archive {}: {}", plain.display(), e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // 활성 파일이 외부에서 사라진 경우 — 새로 열기만 한다
                tracing::warn!("Active log vanished before rotation, reopening");
            }
            Err(e) => return Err(e.into()),
        }

        self.reopen()?;
        self.prune();
        Ok(())
    }

    /// 아카이브 보존 정책 적용 — 개수 규칙과 나이 규칙을 모두 적용합니다.
    pub fn prune(&self) {
        let mut archives = list_archives(&self.archive_dir);

        // 수정 시각 내림차순 — 최신이 앞
        archives.sort_by_key(|(_, modified)| std::cmp::Reverse(*modified));

        for (path, _) in archives.iter().skip(self.config.retention_count) {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!("Failed to prune archive {}: {}", path.display(), e);
            }
        }

        let max_age = Duration::from_secs(self.config.retention_days * 24 * 60 * 60);
        for (path, modified) in archives.iter().take(self.config.retention_count) {
            let age = modified.elapsed().unwrap_or_default();
            if age > max_age {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!("Failed to prune aged archive {}: {}", path.display(), e);
                }
            }
        }
    }

    /// 활성 파일의 마지막 `n`줄을 반환합니다. 부족하면 가장 최근 아카이브의
    /// 꼬리를 앞에 붙여 `n`줄에 가깝게 채웁니다. 파일이 없으면 빈 결과.
    pub fn read_tail(&self, n: usize) -> Vec<String> {
        read_tail_at(&self.active_path, &self.archive_dir, n)
    }

    /// append 핸들을 닫습니다. 프로세스 종료 시 exit-watcher가 호출합니다.
    pub fn close(&mut self) {
        self.writer = None;
    }

    #[cfg(test)]
    fn active_path(&self) -> &Path {
        &self.active_path
    }
}

/// 핸들 없이 경로만으로 꼬리를 읽습니다 — REST의 과거 로그 조회용.
pub fn read_tail_at(active_path: &Path, archive_dir: &Path, n: usize) -> Vec<String> {
    let mut lines = tail_of_file(active_path, n);

    if lines.len() < n {
        let mut archives = list_archives(archive_dir);
        archives.sort_by_key(|(_, modified)| std::cmp::Reverse(*modified));
        if let Some((newest, _)) = archives.first() {
            let missing = n - lines.len();
            let mut head = tail_of_archive(newest, missing);
            head.append(&mut lines);
            lines = head;
        }
    }

    lines
}

/// 서버 작업 디렉토리 기준 활성 로그/아카이브 경로.
pub fn log_paths(working_dir: &Path) -> (PathBuf, PathBuf) {
    let log_dir = working_dir.join("logs");
    (log_dir.join(ACTIVE_NAME), log_dir.join(ARCHIVE_DIR))
}

fn list_archives(archive_dir: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
    let Ok(entries) = fs::read_dir(archive_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.ends_with(".log.gz") || name.ends_with(".log")
        })
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((e.path(), modified))
        })
        .collect()
}

fn compress_archive(plain: &Path) -> Result<()> {
    let gz_path = plain.with_extension("log.gz");
    let mut input = File::open(plain)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    fs::remove_file(plain)?;
    Ok(())
}

fn tail_of_file(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    tail_of_reader(BufReader::new(file), n)
}

fn tail_of_archive(path: &Path, n: usize) -> Vec<String> {
    let Ok(file) = File::open(path) else {
        return Vec::new();
    };
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        tail_of_reader(BufReader::new(GzDecoder::new(file)), n)
    } else {
        tail_of_reader(BufReader::new(file), n)
    }
}

fn tail_of_reader<R: BufRead>(reader: R, n: usize) -> Vec<String> {
    let mut tail: std::collections::VecDeque<String> = std::collections::VecDeque::new();
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into()
}
