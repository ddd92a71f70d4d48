use super::*;
use crate::models::PolicyKind;

fn seeded() -> (MetaStore, Folder) {
    let db = MetaStore::new();
    db.insert_policy(Policy::new(1, "local", PolicyKind::Local));
    let root = db.insert_user(User { id: 7, email: "a@b.c".into(), nick: "a".into(), group: Group::new(1, "users", 1, 1 << 30) }).unwrap();
    (db, root)
}

fn file(name: &str, folder: u64, source: &str, size: u64) -> File {
    let now = Utc::now();
    File { id: 0, name: name.into(), source_name: source.into(), user_id: 7, size, pic_info: String::new(), folder_id: folder, policy_id: 1, created_at: now, updated_at: now }
}

#[test]
fn names_are_unique_per_parent_across_files_and_folders() {
    let (db, root) = seeded();
    db.create_folder("docs", root.id, 7, None).unwrap();
    assert!(matches!(db.create_folder("docs", root.id, 7, None), Err(AppError::ObjectExist { .. })));
    assert!(matches!(db.create_file(file("docs", root.id, "x", 1)), Err(AppError::ObjectExist { .. })));
    db.create_file(file("a.txt", root.id, "p/a", 1)).unwrap();
    assert!(db.create_file(file("a.txt", root.id, "p/b", 1)).is_err());
}

#[test]
fn paths_and_effective_policy() {
    let (db, root) = seeded();
    let docs = db.create_folder("docs", root.id, 7, Some(9)).unwrap();
    let work = db.create_folder("work", docs.id, 7, None).unwrap();
    assert_eq!(db.folder_path(root.id).unwrap(), "/");
    assert_eq!(db.folder_path(work.id).unwrap(), "/docs/work");
    assert_eq!(db.effective_policy(work.id), Some(9));
    assert_eq!(db.effective_policy(root.id), None);
}

#[test]
fn move_into_own_subtree_is_rejected() {
    let (db, root) = seeded();
    let a = db.create_folder("a", root.id, 7, None).unwrap();
    let b = db.create_folder("b", a.id, 7, None).unwrap();
    assert!(db.move_folders(&[a.id], b.id, 7).is_err());
    let c = db.create_folder("c", root.id, 7, None).unwrap();
    db.move_folders(&[c.id], b.id, 7).unwrap();
    assert_eq!(db.folder_path(c.id).unwrap(), "/a/b/c");
}

#[test]
fn copy_creates_soft_links() {
    let (db, root) = seeded();
    let src = db.create_folder("src", root.id, 7, None).unwrap();
    let dst = db.create_folder("dst", root.id, 7, None).unwrap();
    let f = db.create_file(file("a.txt", src.id, "uploads/7/a.txt", 10)).unwrap();
    let sub = db.create_folder("sub", src.id, 7, None).unwrap();
    db.create_file(file("b.txt", sub.id, "uploads/7/b.txt", 5)).unwrap();

    assert_eq!(db.copy_folder(src.id, dst.id, 7).unwrap(), 15);
    let copied = db.child_folder(dst.id, "src").unwrap();
    let copy = db.child_file(copied.id, "a.txt").unwrap();
    assert_eq!(copy.source_name, f.source_name);

    // The original shares its object with the copy, so it is not physically deletable.
    assert!(db.without_soft_links(&[f.clone()]).is_empty());
    assert_eq!(db.without_soft_links(&[f, copy]).len(), 2);
}

#[test]
fn recursive_children_respect_owner() {
    let (db, root) = seeded();
    let a = db.create_folder("a", root.id, 7, None).unwrap();
    db.create_folder("b", a.id, 7, None).unwrap();
    assert_eq!(db.recursive_child_folders(&[a.id], 7, true).len(), 2);
    assert_eq!(db.recursive_child_folders(&[a.id], 7, false).len(), 1);
    assert!(db.recursive_child_folders(&[a.id], 8, true).is_empty());
}
