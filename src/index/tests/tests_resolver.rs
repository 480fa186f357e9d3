//! Key resolver: dense slot assignment and insertion order.

#[cfg(test)]
mod tests {
    use crate::index::{IndexError, KeyResolver};
    use crate::key::Key;

    #[test]
    fn slots_are_assigned_densely() {
        let mut resolver = KeyResolver::new();
        assert_eq!(resolver.resolve_or_create(&Key::from("a")).unwrap(), (0, true));
        assert_eq!(resolver.resolve_or_create(&Key::Int(-3)).unwrap(), (1, true));
        assert_eq!(resolver.resolve_or_create(&Key::from("a")).unwrap(), (0, false));
        assert_eq!(resolver.resolve(&Key::Int(-3)), Some(1));
        assert_eq!(resolver.resolve(&Key::from("missing")), None);
        assert_eq!(resolver.len(), 2);
    }

    #[test]
    fn keys_follow_insertion_order() {
        let mut resolver = KeyResolver::new();
        for key in ["z", "a", "m"] {
            resolver.resolve_or_create(&Key::from(key)).unwrap();
        }
        resolver.resolve_or_create(&Key::from("a")).unwrap();
        assert_eq!(
            resolver.keys(),
            &[Key::from("z"), Key::from("a"), Key::from("m")]
        );
    }

    #[test]
    fn from_ordered_restores_slots() {
        let keys = vec![Key::from("x"), Key::Int(4), Key::from("y")];
        let resolver = KeyResolver::from_ordered(keys.clone()).unwrap();
        assert_eq!(resolver.resolve(&Key::Int(4)), Some(1));
        assert_eq!(resolver.keys(), keys.as_slice());
    }

    #[test]
    fn from_ordered_rejects_duplicates() {
        let err = KeyResolver::from_ordered(vec![Key::Int(1), Key::Int(1)]).unwrap_err();
        assert!(matches!(err, IndexError::Corrupt(_)));
    }

    #[test]
    fn pop_forgets_newest_key() {
        let mut resolver = KeyResolver::new();
        resolver.resolve_or_create(&Key::Int(1)).unwrap();
        resolver.resolve_or_create(&Key::Int(2)).unwrap();
        resolver.pop();
        assert_eq!(resolver.resolve(&Key::Int(2)), None);
        assert_eq!(resolver.resolve_or_create(&Key::Int(3)).unwrap(), (1, true));
    }
}
