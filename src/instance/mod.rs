use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// 서버 인스턴스 — 영속 계층이 제공하는 관리 대상 서버 서술자
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInstance {
    pub id: i64,                      // 고유 ID
    pub name: String,                 // 사용자 지정 이름 (예: "메인 마크 서버")
    pub working_dir: PathBuf,         // 서버 작업 디렉토리
    /// 수퍼바이저 프로세스 기동 커맨드 (프로그램 + 인자)
    pub launch_command: Vec<String>,
    /// stdin으로 보내는 graceful 종료 명령
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
    /// 이벤트 릴레이에 쓰이는 서버 그룹 멤버십
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_stop_command() -> String {
    "stop".to_string()
}

impl ServerInstance {
    pub fn new(id: i64, name: &str, working_dir: &Path) -> Self {
        Self {
            id,
            name: name.to_string(),
            working_dir: working_dir.to_path_buf(),
            launch_command: Vec::new(),
            stop_command: default_stop_command(),
            groups: Vec::new(),
        }
    }

    /// 이 인스턴스가 주어진 플러그인 보고 이름과 일치하는가.
    /// 표시 이름 또는 작업 디렉토리의 마지막 구성 요소로 매칭합니다.
    pub fn matches_reported_name(&self, reported: &str) -> bool {
        if self.name == reported {
            return true;
        }
        self.working_dir
            .file_name()
            .map(|d| d.to_string_lossy() == reported)
            .unwrap_or(false)
    }
}

/// 인스턴스 저장소 — instances.json 관리
///
/// 여러 컴포넌트(supervisor, broadcaster, gateway)가 읽기 위주로 공유하므로
/// 내부를 RwLock으로 감쌉니다.
pub struct InstanceStore {
    file_path: PathBuf,
    instances: RwLock<Vec<ServerInstance>>,
}

impl InstanceStore {
    pub fn new(file_path: &str) -> Self {
        Self {
            file_path: PathBuf::from(file_path),
            instances: RwLock::new(Vec::new()),
        }
    }

    /// 파일에서 인스턴스 로드
    pub fn load(&self) -> Result<()> {
        if !self.file_path.exists() {
            tracing::info!("Instance store file does not exist, starting empty");
            return Ok(());
        }

        let content = fs::read_to_string(&self.file_path)?;
        let loaded: Vec<ServerInstance> = serde_json::from_str(&content)?;
        tracing::info!("Loaded {} instances", loaded.len());
        *self.instances.write().unwrap() = loaded;
        Ok(())
    }

    /// 파일에 인스턴스 저장
    pub fn save(&self) -> Result<()> {
        let instances = self.instances.read().unwrap();
        let content = serde_json::to_string_pretty(&*instances)?;
        fs::write(&self.file_path, content)?;
        tracing::info!("Saved {} instances", instances.len());
        Ok(())
    }

    /// 인스턴스 추가
    pub fn add(&self, instance: ServerInstance) -> Result<()> {
        self.instances.write().unwrap().push(instance);
        self.save()?;
        Ok(())
    }

    /// 인스턴스 조회
    pub fn get(&self, id: i64) -> Option<ServerInstance> {
        self.instances.read().unwrap().iter().find(|i| i.id == id).cloned()
    }

    /// 모든 인스턴스 조회
    pub fn list(&self) -> Vec<ServerInstance> {
        self.instances.read().unwrap().clone()
    }

    /// 플러그인이 보고한 서버 이름으로 인스턴스 찾기
    pub fn find_by_reported_name(&self, reported: &str) -> Option<ServerInstance> {
        self.instances
            .read()
            .unwrap()
            .iter()
            .find(|i| i.matches_reported_name(reported))
            .cloned()
    }

    /// 인스턴스가 속한 그룹 목록
    pub fn groups_of(&self, id: i64) -> Vec<String> {
        self.get(id).map(|i| i.groups).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: i64, name: &str, dir: &str) -> ServerInstance {
        ServerInstance::new(id, name, Path::new(dir))
    }

    #[test]
    fn test_matches_reported_name() {
        let inst = sample(1, "main", "/srv/servers/survival");
        assert!(inst.matches_reported_name("main"));
        assert!(inst.matches_reported_name("survival"));
        assert!(!inst.matches_reported_name("creative"));
    }

    #[test]
    fn test_store_lookup() {
        let store = InstanceStore::new("/nonexistent/instances.json");
        store.instances.write().unwrap().push(sample(1, "a", "/srv/a"));
        store.instances.write().unwrap().push(sample(2, "b", "/srv/b"));

        assert_eq!(store.get(1).unwrap().name, "a");
        assert!(store.get(99).is_none());
        assert_eq!(store.find_by_reported_name("b").unwrap().id, 2);
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn test_groups_of() {
        let store = InstanceStore::new("/nonexistent/instances.json");
        let mut inst = sample(7, "lobby", "/srv/lobby");
        inst.groups = vec!["network".to_string(), "hub".to_string()];
        store.instances.write().unwrap().push(inst);

        assert_eq!(store.groups_of(7), vec!["network", "hub"]);
        assert!(store.groups_of(8).is_empty());
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let store = InstanceStore::new("/definitely/not/here.json");
        assert!(store.load().is_ok());
        assert!(store.list().is_empty());
    }
}
