//! 主题与前置依赖图
//!
//! 主题一旦被任务引用即视为不可变；前置依赖必须无环，
//! 成环属于数据完整性错误，检测到即上抛，不做静默修复。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

use super::TopicId;

/// 考试大纲领域（类别）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Category {
    Algorithms,
    DataStructures,
    Systems,
    Databases,
    Networking,
    Security,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Algorithms,
        Category::DataStructures,
        Category::Systems,
        Category::Databases,
        Category::Networking,
        Category::Security,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Algorithms => "algorithms",
            Category::DataStructures => "data_structures",
            Category::Systems => "systems",
            Category::Databases => "databases",
            Category::Networking => "networking",
            Category::Security => "security",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 难度三档；PartialOrd 用于难度升降（Easy < Medium < Hard）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    /// 降一档，Easy 保持不变
    pub fn lowered(self) -> Self {
        match self {
            Difficulty::Hard => Difficulty::Medium,
            _ => Difficulty::Easy,
        }
    }

    /// 升一档，Hard 保持不变
    pub fn raised(self) -> Self {
        match self {
            Difficulty::Easy => Difficulty::Medium,
            _ => Difficulty::Hard,
        }
    }
}

/// 备考主题：重要度 1-10，预估学习时长（分钟），前置主题集合
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub name: String,
    pub category: Category,
    pub difficulty: Difficulty,
    /// 1-10，用于时间分配与就绪度加权
    pub importance: u8,
    pub estimated_duration_min: i64,
    /// 前置主题 id 集合，必须无环
    #[serde(default)]
    pub prerequisites: Vec<TopicId>,
    pub created_at: DateTime<Utc>,
}

/// 主题前置依赖图：仅用于合法性检查与排期顺序，引擎不创建新主题
pub struct TopicGraph {
    topics: HashMap<TopicId, Topic>,
}

impl TopicGraph {
    /// 构建依赖图并校验：未知前置与成环都是 DataIntegrity 错误
    pub fn new(topics: Vec<Topic>) -> EngineResult<Self> {
        let map: HashMap<TopicId, Topic> =
            topics.into_iter().map(|t| (t.id.clone(), t)).collect();

        for topic in map.values() {
            for dep in &topic.prerequisites {
                if !map.contains_key(dep) {
                    return Err(EngineError::DataIntegrity(format!(
                        "topic '{}' requires unknown prerequisite '{}'",
                        topic.id, dep
                    )));
                }
            }
        }

        let graph = Self { topics: map };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn get(&self, id: &str) -> Option<&Topic> {
        self.topics.get(id)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Kahn 拓扑排序；入度相同的就绪节点按优先函数取最大者，
    /// 排期器借此把「更弱 / 更重要」的主题前置。
    pub fn ordered_by<F>(&self, priority: F) -> Vec<&Topic>
    where
        F: Fn(&Topic) -> i64,
    {
        let mut in_degree: HashMap<&str, usize> = self
            .topics
            .values()
            .map(|t| (t.id.as_str(), t.prerequisites.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for topic in self.topics.values() {
            for dep in &topic.prerequisites {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(topic.id.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut out = Vec::with_capacity(self.topics.len());

        while !ready.is_empty() {
            // 在就绪集合中取优先级最高者；同分时按 id 保证确定性
            ready.sort_by_key(|id| {
                let t = &self.topics[*id];
                (std::cmp::Reverse(priority(t)), t.id.clone())
            });
            let next = ready.remove(0);
            out.push(&self.topics[next]);

            if let Some(children) = dependents.get(next) {
                for &child in children {
                    if let Some(d) = in_degree.get_mut(child) {
                        *d -= 1;
                        if *d == 0 {
                            ready.push(child);
                        }
                    }
                }
            }
        }

        out
    }

    /// 检测前置依赖是否成环（DFS 三色标记：0 未访问 / 1 在栈上 / 2 已完成）
    fn check_acyclic(&self) -> EngineResult<()> {
        fn visit(
            id: &str,
            topics: &HashMap<TopicId, Topic>,
            color: &mut HashMap<String, u8>,
        ) -> bool {
            color.insert(id.to_string(), 1);
            if let Some(topic) = topics.get(id) {
                for dep in &topic.prerequisites {
                    match color.get(dep.as_str()).copied().unwrap_or(0) {
                        1 => return false,
                        0 => {
                            if !visit(dep, topics, color) {
                                return false;
                            }
                        }
                        _ => {}
                    }
                }
            }
            color.insert(id.to_string(), 2);
            true
        }

        let mut color: HashMap<String, u8> = HashMap::new();
        for id in self.topics.keys() {
            if color.get(id.as_str()).copied().unwrap_or(0) == 0
                && !visit(id, &self.topics, &mut color)
            {
                return Err(EngineError::DataIntegrity(format!(
                    "prerequisite cycle involving topic '{id}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(id: &str, prereqs: &[&str]) -> Topic {
        Topic {
            id: id.to_string(),
            name: id.to_uppercase(),
            category: Category::Algorithms,
            difficulty: Difficulty::Medium,
            importance: 5,
            estimated_duration_min: 60,
            prerequisites: prereqs.iter().map(|s| s.to_string()).collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let err = TopicGraph::new(vec![
            topic("a", &["b"]),
            topic("b", &["c"]),
            topic("c", &["a"]),
        ])
        .unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn test_unknown_prerequisite_is_rejected() {
        let err = TopicGraph::new(vec![topic("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
    }

    #[test]
    fn test_topological_order_respects_prerequisites() {
        let graph = TopicGraph::new(vec![
            topic("base", &[]),
            topic("mid", &["base"]),
            topic("top", &["mid"]),
        ])
        .unwrap();
        let order: Vec<&str> = graph.ordered_by(|_| 0).iter().map(|t| t.id.as_str()).collect();
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("base") < pos("mid"));
        assert!(pos("mid") < pos("top"));
    }

    #[test]
    fn test_priority_breaks_ties_among_ready_topics() {
        let mut hot = topic("hot", &[]);
        hot.importance = 9;
        let cold = topic("cold", &[]);
        let graph = TopicGraph::new(vec![hot, cold]).unwrap();
        let order: Vec<&str> = graph
            .ordered_by(|t| t.importance as i64)
            .iter()
            .map(|t| t.id.as_str())
            .collect();
        assert_eq!(order, vec!["hot", "cold"]);
    }

    #[test]
    fn test_difficulty_tiers() {
        assert_eq!(Difficulty::Hard.lowered(), Difficulty::Medium);
        assert_eq!(Difficulty::Easy.lowered(), Difficulty::Easy);
        assert_eq!(Difficulty::Easy.raised(), Difficulty::Medium);
        assert_eq!(Difficulty::Hard.raised(), Difficulty::Hard);
    }
}
