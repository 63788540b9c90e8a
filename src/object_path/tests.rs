use super::ObjectPath;

#[test]
fn valid_paths() {
    assert!(ObjectPath::new("/").is_ok());
    assert!(ObjectPath::new("/a").is_ok());
    assert!(ObjectPath::new("/org/freedesktop/DBus").is_ok());
    assert!(ObjectPath::new("/com/example/_private0").is_ok());
}

#[test]
fn invalid_paths() {
    assert!(ObjectPath::new("").is_err());
    assert!(ObjectPath::new("a").is_err());
    assert!(ObjectPath::new("//").is_err());
    assert!(ObjectPath::new("/a/").is_err());
    assert!(ObjectPath::new("/a//b").is_err());
    assert!(ObjectPath::new("/a b").is_err());
    assert!(ObjectPath::new("/a-b").is_err());
    assert!(ObjectPath::new("/a.b").is_err());
}

#[test]
fn starts_with_respects_segments() {
    let path = ObjectPath::new("/org/example/Widget").unwrap();

    assert!(path.starts_with(ObjectPath::ROOT));
    assert!(path.starts_with(ObjectPath::new("/org").unwrap()));
    assert!(path.starts_with(ObjectPath::new("/org/example").unwrap()));
    assert!(path.starts_with(path));
    assert!(!path.starts_with(ObjectPath::new("/org/exam").unwrap()));
    assert!(!path.starts_with(ObjectPath::new("/net").unwrap()));
}
