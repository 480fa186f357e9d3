//! `LogDict` behavior: key kinds, ordering, commit/checkpoint and reopen.
//!
//! ## See also
//! - [`tests_wal`]: the record log underneath

#[cfg(test)]
mod tests {
    use crate::dict::tests::helpers::init_tracing;
    use crate::dict::{DictError, LogDict, STR_KEY_LIMIT};
    use crate::key::{Key, KeyKind};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn bytes(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    // ----------------------------------------------------------------
    // Basic operations
    // ----------------------------------------------------------------

    /// # Scenario
    /// set / get / delete on an integer dictionary.
    ///
    /// # Expected behavior
    /// Values read back, replacing a key keeps one entry, deleting removes it
    /// and reports whether it existed.
    #[test]
    fn set_get_delete() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();

        dict.set(&Key::Int(1), bytes("one")).unwrap();
        dict.set(&Key::Int(2), bytes("two")).unwrap();
        dict.set(&Key::Int(1), bytes("uno")).unwrap();

        assert_eq!(dict.get(&Key::Int(1)).unwrap(), Some(&b"uno"[..]));
        assert_eq!(dict.len(), 2);

        assert!(dict.delete(&Key::Int(2)).unwrap());
        assert!(!dict.delete(&Key::Int(2)).unwrap());
        assert_eq!(dict.get(&Key::Int(2)).unwrap(), None);
        assert_eq!(dict.len(), 1);
    }

    /// # Scenario
    /// Keys of the wrong kind are rejected before anything is logged.
    #[test]
    fn wrong_key_kind_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut ints = LogDict::open(tmp.path(), "ints", KeyKind::Int).unwrap();
        let mut strs = LogDict::open(tmp.path(), "strs", KeyKind::Str).unwrap();

        let err = ints.set(&Key::from("x"), bytes("v")).unwrap_err();
        assert!(matches!(
            err,
            DictError::KeyTypeMismatch {
                expected: KeyKind::Int,
                found: KeyKind::Str
            }
        ));
        let err = strs.get(&Key::Int(5)).unwrap_err();
        assert!(matches!(err, DictError::KeyTypeMismatch { .. }));
        assert!(!ints.requires_commit());
    }

    /// # Scenario
    /// Enumeration order depends on the key kind.
    ///
    /// # Expected behavior
    /// Integer keys come back ascending; string keys in first-insertion
    /// order, unaffected by later replacement.
    #[test]
    fn key_order_by_kind() {
        let tmp = TempDir::new().unwrap();
        let mut ints = LogDict::open(tmp.path(), "ints", KeyKind::Int).unwrap();
        for n in [30, -4, 7, 12] {
            ints.set(&Key::Int(n), bytes("v")).unwrap();
        }
        assert_eq!(
            ints.keys(),
            vec![Key::Int(-4), Key::Int(7), Key::Int(12), Key::Int(30)]
        );

        let mut strs = LogDict::open(tmp.path(), "strs", KeyKind::Str).unwrap();
        for k in ["zeta", "alpha", "mid"] {
            strs.set(&Key::from(k), bytes("v")).unwrap();
        }
        strs.set(&Key::from("zeta"), bytes("again")).unwrap();
        assert_eq!(
            strs.keys(),
            vec![Key::from("zeta"), Key::from("alpha"), Key::from("mid")]
        );
    }

    /// # Scenario
    /// Over-long string keys are truncated to the limit on a char boundary.
    ///
    /// # Actions
    /// 1. Set a key of 600 bytes made of two-byte characters, offset by one
    ///    ASCII byte so the limit falls inside a character.
    /// 2. Read it back with the original key.
    ///
    /// # Expected behavior
    /// The stored key is at most 512 bytes and valid UTF-8; the original key
    /// still finds the value.
    #[test]
    fn long_string_keys_are_truncated() {
        let tmp = TempDir::new().unwrap();
        let mut dict = LogDict::open(tmp.path(), "long", KeyKind::Str).unwrap();
        let long = format!("a{}", "é".repeat(300));
        assert!(long.len() > STR_KEY_LIMIT);

        dict.set(&Key::from(long.as_str()), bytes("v")).unwrap();
        let stored = dict.keys().pop().unwrap();
        let stored = stored.as_str().unwrap();
        assert!(stored.len() <= STR_KEY_LIMIT);
        assert!(long.starts_with(stored));
        assert_eq!(dict.get(&Key::from(long)).unwrap(), Some(&b"v"[..]));
    }

    // ----------------------------------------------------------------
    // Durability
    // ----------------------------------------------------------------

    /// # Scenario
    /// The dirty flag tracks uncommitted writes; reads commit first.
    #[test]
    fn dirty_until_commit_or_read() {
        let tmp = TempDir::new().unwrap();
        let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Str).unwrap();
        assert!(!dict.requires_commit());

        dict.set(&Key::from("a"), bytes("1")).unwrap();
        assert!(dict.requires_commit());
        dict.commit().unwrap();
        assert!(!dict.requires_commit());

        dict.set(&Key::from("b"), bytes("2")).unwrap();
        dict.get(&Key::from("a")).unwrap();
        assert!(!dict.requires_commit());
    }

    /// # Scenario
    /// State survives close and reopen through WAL replay.
    #[test]
    fn reopen_replays_log() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
            for n in 0..50 {
                dict.set(&Key::Int(n), n.to_le_bytes().to_vec()).unwrap();
            }
            dict.delete(&Key::Int(10)).unwrap();
            dict.close().unwrap();
        }

        let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
        assert_eq!(dict.len(), 49);
        assert_eq!(dict.get(&Key::Int(10)).unwrap(), None);
        assert_eq!(
            dict.get(&Key::Int(42)).unwrap(),
            Some(&42i64.to_le_bytes()[..])
        );
    }

    /// # Scenario
    /// Committing past the checkpoint threshold writes a snapshot and empties
    /// the WAL; reopening reads the snapshot plus any newer records.
    #[test]
    fn checkpoint_then_reopen() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let mut dict = LogDict::open_with(tmp.path(), "d", KeyKind::Str, 8).unwrap();
            for n in 0..10 {
                dict.set(&Key::from(format!("k{n}")), bytes("old")).unwrap();
            }
            dict.commit().unwrap();
            assert!(tmp.path().join("d.snapshot").is_file());

            dict.set(&Key::from("k3"), bytes("new")).unwrap();
            dict.set(&Key::from("extra"), bytes("x")).unwrap();
            dict.close().unwrap();
        }

        let mut dict = LogDict::open_with(tmp.path(), "d", KeyKind::Str, 8).unwrap();
        assert_eq!(dict.len(), 11);
        assert_eq!(dict.get(&Key::from("k3")).unwrap(), Some(&b"new"[..]));
        assert_eq!(dict.get(&Key::from("k9")).unwrap(), Some(&b"old"[..]));
        assert_eq!(dict.keys()[0], Key::from("k0"));
        assert_eq!(dict.keys()[10], Key::from("extra"));
    }

    /// # Scenario
    /// A torn record at the end of the WAL is cut off on open.
    ///
    /// # Actions
    /// 1. Write and commit three keys, close.
    /// 2. Append half a frame of garbage to the WAL.
    /// 3. Reopen, write one more key, reopen again.
    ///
    /// # Expected behavior
    /// Both reopens succeed; all four keys are present at the end.
    #[test]
    fn torn_tail_is_truncated_on_open() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        {
            let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
            for n in 0..3 {
                dict.set(&Key::Int(n), bytes("v")).unwrap();
            }
            dict.close().unwrap();
        }
        let wal = tmp.path().join("d.wal");
        let mut f = OpenOptions::new().append(true).open(&wal).unwrap();
        f.write_all(&[20, 0, 0, 0, 1, 2]).unwrap();
        drop(f);
        let torn_len = fs::metadata(&wal).unwrap().len();

        {
            let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
            assert_eq!(dict.len(), 3);
            assert!(fs::metadata(&wal).unwrap().len() < torn_len);
            dict.set(&Key::Int(3), bytes("v")).unwrap();
            dict.close().unwrap();
        }

        let dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
        assert_eq!(dict.keys(), (0..4).map(Key::Int).collect::<Vec<_>>());
    }

    /// # Scenario
    /// Garbage lands at the end of the WAL while the dictionary is open.
    ///
    /// # Actions
    /// 1. Set `"a"`.
    /// 2. Append half a frame to the WAL file.
    /// 3. Set `"b"`, commit, close, reopen.
    ///
    /// # Expected behavior
    /// Both keys survive the reopen; the committed `"b"` is not lost behind
    /// the torn frame.
    #[test]
    fn committed_write_after_torn_frame_survives() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let wal = tmp.path().join("d.wal");
        {
            let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Str).unwrap();
            dict.set(&Key::from("a"), bytes("1")).unwrap();

            let mut f = OpenOptions::new().append(true).open(&wal).unwrap();
            f.write_all(&[20, 0, 0, 0, 1, 2]).unwrap();
            drop(f);

            dict.set(&Key::from("b"), bytes("2")).unwrap();
            dict.commit().unwrap();
            dict.close().unwrap();
        }

        let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Str).unwrap();
        assert_eq!(dict.get(&Key::from("a")).unwrap(), Some(&b"1"[..]));
        assert_eq!(dict.get(&Key::from("b")).unwrap(), Some(&b"2"[..]));
    }

    /// # Scenario
    /// A snapshot written for one key kind cannot be opened as the other.
    #[test]
    fn snapshot_kind_is_checked() {
        let tmp = TempDir::new().unwrap();
        {
            let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
            dict.set(&Key::Int(1), bytes("v")).unwrap();
            dict.checkpoint().unwrap();
        }
        let err = LogDict::open(tmp.path(), "d", KeyKind::Str).unwrap_err();
        assert!(matches!(err, DictError::KeyTypeMismatch { .. }), "{err:?}");
    }

    /// # Scenario
    /// Operations after `close` fail with `Closed`; closing twice is fine.
    #[test]
    fn closed_dictionary_refuses_writes() {
        let tmp = TempDir::new().unwrap();
        let mut dict = LogDict::open(tmp.path(), "d", KeyKind::Int).unwrap();
        dict.close().unwrap();
        dict.close().unwrap();
        assert!(!dict.is_open());
        assert!(matches!(
            dict.set(&Key::Int(1), bytes("v")),
            Err(DictError::Closed)
        ));
    }
}
