//! "Next node" lookups over an ordered course snapshot.
//!
//! Every lookup follows the same pattern: next sibling by position, else the
//! first child of the parent's next sibling, else nothing. Containers with no
//! children are skipped, so a partially populated tree never ends a walk early.
//! All functions are pure; the same input always yields the same answer.

use super::models::{ContentBlock, CourseTree, Lesson, LessonNode, Module, ModuleNode, Positioned};

/// How far a block walk may go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalScope {
    /// Stay inside the current lesson.
    Lesson,
    /// Cross lesson and module boundaries.
    Course,
}

/// Item with the smallest position.
pub fn first_by_position<T: Positioned>(items: &[T]) -> Option<&T> {
    items.iter().min_by_key(|item| item.position())
}

/// Item with the smallest position strictly greater than `current`.
pub fn next_by_position<T: Positioned>(items: &[T], current: i32) -> Option<&T> {
    items
        .iter()
        .filter(|item| item.position() > current)
        .min_by_key(|item| item.position())
}

/// Items after `current`, in ascending position order.
fn successors<T: Positioned>(items: &[T], current: i32) -> Vec<&T> {
    let mut after: Vec<&T> = items.iter().filter(|i| i.position() > current).collect();
    after.sort_by_key(|i| i.position());
    after
}

fn ordered<T: Positioned>(items: &[T]) -> Vec<&T> {
    successors(items, i32::MIN)
}

fn first_block_of_lesson(node: &LessonNode) -> Option<&ContentBlock> {
    first_by_position(&node.blocks)
}

fn first_block_of_module(node: &ModuleNode) -> Option<&ContentBlock> {
    ordered(&node.lessons)
        .into_iter()
        .find_map(first_block_of_lesson)
}

fn first_lesson_of_module(node: &ModuleNode) -> Option<&Lesson> {
    first_by_position(&node.lessons).map(|l| &l.lesson)
}

pub fn locate_module(tree: &CourseTree, module_id: i64) -> Option<&ModuleNode> {
    tree.modules.iter().find(|m| m.module.id == module_id)
}

pub fn locate_lesson(tree: &CourseTree, lesson_id: i64) -> Option<(&ModuleNode, &LessonNode)> {
    tree.modules.iter().find_map(|m| {
        m.lessons
            .iter()
            .find(|l| l.lesson.id == lesson_id)
            .map(|l| (m, l))
    })
}

pub fn locate_block(
    tree: &CourseTree,
    block_id: i64,
) -> Option<(&ModuleNode, &LessonNode, &ContentBlock)> {
    tree.modules.iter().find_map(|m| {
        m.lessons.iter().find_map(|l| {
            l.blocks
                .iter()
                .find(|b| b.id == block_id)
                .map(|b| (m, l, b))
        })
    })
}

// ── Modules ──────────────────────────────────────────────────────────

pub fn first_module(tree: &CourseTree) -> Option<&Module> {
    first_by_position(&tree.modules).map(|m| &m.module)
}

/// Next module in the course. Modules are not skipped for being empty:
/// module planning is what fills them.
pub fn next_module(tree: &CourseTree, module_id: i64) -> Option<&Module> {
    let current = locate_module(tree, module_id)?;
    next_by_position(&tree.modules, current.module.position).map(|m| &m.module)
}

// ── Lessons ──────────────────────────────────────────────────────────

/// First lesson of the first module that has any.
pub fn first_lesson(tree: &CourseTree) -> Option<&Lesson> {
    ordered(&tree.modules)
        .into_iter()
        .find_map(first_lesson_of_module)
}

/// Next lesson in the same module, else the first lesson of the next
/// non-empty module.
pub fn next_lesson(tree: &CourseTree, lesson_id: i64) -> Option<&Lesson> {
    let (module, lesson) = locate_lesson(tree, lesson_id)?;
    if let Some(next) = next_by_position(&module.lessons, lesson.lesson.position) {
        return Some(&next.lesson);
    }
    successors(&tree.modules, module.module.position)
        .into_iter()
        .find_map(first_lesson_of_module)
}

// ── Content blocks ───────────────────────────────────────────────────

pub fn first_block_in_lesson(tree: &CourseTree, lesson_id: i64) -> Option<&ContentBlock> {
    let (_, lesson) = locate_lesson(tree, lesson_id)?;
    first_block_of_lesson(lesson)
}

pub fn first_block(tree: &CourseTree) -> Option<&ContentBlock> {
    ordered(&tree.modules)
        .into_iter()
        .find_map(first_block_of_module)
}

/// Block after `block_id`: next sibling, else (course scope only) the first
/// block of the next lesson in the module, else the first block of the next
/// module's lessons.
pub fn next_block(tree: &CourseTree, block_id: i64, scope: TraversalScope) -> Option<&ContentBlock> {
    let (module, lesson, block) = locate_block(tree, block_id)?;
    if let Some(next) = next_by_position(&lesson.blocks, block.position) {
        return Some(next);
    }
    if scope == TraversalScope::Lesson {
        return None;
    }
    successors(&module.lessons, lesson.lesson.position)
        .into_iter()
        .find_map(first_block_of_lesson)
        .or_else(|| {
            successors(&tree.modules, module.module.position)
                .into_iter()
                .find_map(first_block_of_module)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::models::{ContentType, Course};

    /// Builds a tree from `shape[module][lesson] = block count`. Ids are
    /// `m*100`, `m*100 + l*10`, `m*100 + l*10 + b` (1-based).
    fn tree(shape: &[&[usize]]) -> CourseTree {
        let modules = shape
            .iter()
            .enumerate()
            .map(|(mi, lessons)| {
                let module_id = (mi as i64 + 1) * 100;
                ModuleNode {
                    module: Module {
                        id: module_id,
                        course_id: 1,
                        title: format!("M{}", mi + 1),
                        description: String::new(),
                        goal: String::new(),
                        estimated_time_hours: 1.0,
                        position: mi as i32,
                    },
                    lessons: lessons
                        .iter()
                        .enumerate()
                        .map(|(li, &blocks)| {
                            let lesson_id = module_id + (li as i64 + 1) * 10;
                            LessonNode {
                                lesson: Lesson {
                                    id: lesson_id,
                                    module_id,
                                    title: format!("L{}", li + 1),
                                    description: String::new(),
                                    goal: String::new(),
                                    estimated_time_hours: 1.0,
                                    position: li as i32,
                                },
                                blocks: (0..blocks)
                                    .map(|bi| ContentBlock {
                                        id: lesson_id + bi as i64 + 1,
                                        lesson_id,
                                        block_type: ContentType::Text,
                                        description: String::new(),
                                        goal: String::new(),
                                        outline: String::new(),
                                        content: None,
                                        position: bi as i32,
                                    })
                                    .collect(),
                            }
                        })
                        .collect(),
                }
            })
            .collect();
        CourseTree {
            course: Course {
                id: 1,
                profile_id: None,
                owner: None,
                title: "Course".to_string(),
                description: String::new(),
                goal: String::new(),
                estimated_time_hours: 1.0,
                created_at: String::new(),
            },
            modules,
        }
    }

    fn walk_blocks(tree: &CourseTree) -> Vec<i64> {
        let mut visited = Vec::new();
        let mut current = first_block(tree);
        while let Some(block) = current {
            visited.push(block.id);
            current = next_block(tree, block.id, TraversalScope::Course);
        }
        visited
    }

    #[test]
    fn test_next_block_within_lesson() {
        let t = tree(&[&[3, 3], &[3, 3]]);
        assert_eq!(next_block(&t, 111, TraversalScope::Lesson).map(|b| b.id), Some(112));
        assert_eq!(next_block(&t, 112, TraversalScope::Lesson).map(|b| b.id), Some(113));
        assert_eq!(next_block(&t, 113, TraversalScope::Lesson), None);
    }

    #[test]
    fn test_next_block_crosses_lessons_and_modules() {
        let t = tree(&[&[3, 3], &[3, 3]]);
        assert_eq!(next_block(&t, 113, TraversalScope::Course).map(|b| b.id), Some(121));
        assert_eq!(next_block(&t, 123, TraversalScope::Course).map(|b| b.id), Some(211));
        assert_eq!(next_block(&t, 223, TraversalScope::Course), None);
    }

    #[test]
    fn test_full_walk_visits_every_block_once_in_order() {
        let t = tree(&[&[3, 3], &[3, 3]]);
        let visited = walk_blocks(&t);
        assert_eq!(
            visited,
            vec![111, 112, 113, 121, 122, 123, 211, 212, 213, 221, 222, 223]
        );
    }

    #[test]
    fn test_walk_skips_empty_containers() {
        // Module 2 has no lessons, lesson 1 of module 3 has no blocks.
        let t = tree(&[&[1], &[], &[0, 2]]);
        assert_eq!(walk_blocks(&t), vec![111, 321, 322]);
        assert_eq!(first_lesson(&tree(&[&[], &[2]])).map(|l| l.id), Some(210));
    }

    #[test]
    fn test_lesson_walk_crosses_modules() {
        let t = tree(&[&[0, 0], &[], &[0]]);
        assert_eq!(first_lesson(&t).map(|l| l.id), Some(110));
        assert_eq!(next_lesson(&t, 110).map(|l| l.id), Some(120));
        assert_eq!(next_lesson(&t, 120).map(|l| l.id), Some(310));
        assert_eq!(next_lesson(&t, 310), None);
    }

    #[test]
    fn test_next_module_does_not_skip_empty_modules() {
        let t = tree(&[&[], &[], &[]]);
        assert_eq!(first_module(&t).map(|m| m.id), Some(100));
        assert_eq!(next_module(&t, 100).map(|m| m.id), Some(200));
        assert_eq!(next_module(&t, 200).map(|m| m.id), Some(300));
        assert_eq!(next_module(&t, 300), None);
    }

    #[test]
    fn test_order_follows_position_not_storage_order() {
        let mut t = tree(&[&[3]]);
        // Reverse storage order and leave gaps in positions.
        let blocks = &mut t.modules[0].lessons[0].blocks;
        blocks.reverse();
        for block in blocks.iter_mut() {
            block.position *= 10;
        }
        assert_eq!(first_block_in_lesson(&t, 110).map(|b| b.id), Some(111));
        assert_eq!(walk_blocks(&t), vec![111, 112, 113]);
    }

    #[test]
    fn test_unknown_nodes_yield_none() {
        let t = tree(&[&[2]]);
        assert_eq!(next_block(&t, 999, TraversalScope::Course), None);
        assert_eq!(next_lesson(&t, 999), None);
        assert_eq!(next_module(&t, 999), None);
        assert_eq!(first_block_in_lesson(&t, 999), None);
    }

    #[test]
    fn test_traversal_is_deterministic() {
        let t = tree(&[&[2, 1], &[3]]);
        for _ in 0..3 {
            assert_eq!(next_block(&t, 112, TraversalScope::Course).map(|b| b.id), Some(121));
            assert_eq!(next_lesson(&t, 120).map(|l| l.id), Some(210));
        }
    }

    #[test]
    fn test_empty_course() {
        let t = tree(&[]);
        assert!(first_module(&t).is_none());
        assert!(first_lesson(&t).is_none());
        assert!(first_block(&t).is_none());
    }
}
