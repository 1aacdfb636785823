//! Convenience macros for shipping scripts inside the binary.

/// Build an [EmbeddedSource](crate::EmbeddedSource) from script files compiled into the binary.
///
/// The directory is relative to the calling crate's `CARGO_MANIFEST_DIR`, and every file is read
/// with [`include_str!`] at compile time, so a missing file is a build error rather than a
/// discovery error at startup.
///
/// ```ignore
/// use scriptura::embed_scripts;
///
/// let source = embed_scripts!("migrations";
///     "001_create_users.sql",
///     "002_add_email.up.sql",
///     "002_add_email.down.sql",
/// );
/// ```
///
/// The file names go through the same rules as a [DirectorySource](crate::DirectorySource):
/// `.up.sql` and `.down.sql` pair up, and files without a `.sql` extension are ignored.
#[macro_export]
macro_rules! embed_scripts {
    ($dir:literal; $($file:literal),+ $(,)?) => {
        $crate::EmbeddedSource::from_files(::std::vec![
            $((
                $file,
                include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/", $dir, "/", $file)),
            )),+
        ])
    };
}
