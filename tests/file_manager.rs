// Tests for file listing and resolution

#[cfg(test)]
mod tests {
    use krusty_loader::error::GCodeError;
    use krusty_loader::file_manager::*;
    use std::fs as stdfs;
    use std::io::Write;
    use tempfile::tempdir;

    fn touch(path: &std::path::Path, contents: &str) {
        let mut file = stdfs::File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_list_files_filters_and_sorts() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("b.GCODE"), "G28\n");
        touch(&dir.path().join("A.gcode"), "G28\nG1 X1\n");
        touch(&dir.path().join("c.txt"), "hello");
        touch(&dir.path().join(".hidden.gcode"), "G28");
        stdfs::create_dir(dir.path().join("sub")).unwrap();
        touch(&dir.path().join("sub").join("part.g"), "G1");

        let manager = FileManager::new(dir.path());
        let names: Vec<String> = manager
            .list_files(false)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["A.gcode", "b.GCODE"]);

        let files = manager.list_files(true).await.unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![".hidden.gcode", "A.gcode", "b.GCODE", "sub/part.g"]);
        let a = files.iter().find(|f| f.name == "A.gcode").unwrap();
        assert_eq!(a.size, 10);
    }

    #[tokio::test]
    async fn test_resolve_exact_and_case_insensitive() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("Benchy.gcode"), "G28\n");
        stdfs::create_dir(dir.path().join("parts")).unwrap();
        touch(&dir.path().join("parts").join("Cube.gcode"), "G28\n");
        let manager = FileManager::new(dir.path());

        let found = manager.resolve("./Benchy.gcode", false).await.unwrap();
        assert_eq!(found.name, "Benchy.gcode");
        let found = manager.resolve("benchy.GCODE", false).await.unwrap();
        assert_eq!(found.name, "Benchy.gcode");

        // Subdirectories are only searched when asked for.
        let err = manager.resolve("parts/Cube.gcode", false).await.unwrap_err();
        assert!(matches!(err, GCodeError::FileNotFound(_)));
        let found = manager.resolve("/parts/cube.gcode", true).await.unwrap();
        assert_eq!(found.name, "parts/Cube.gcode");

        let err = manager.resolve("missing.gcode", true).await.unwrap_err();
        assert!(matches!(err, GCodeError::FileNotFound(name) if name == "missing.gcode"));
    }

    #[tokio::test]
    async fn test_custom_extensions() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.nc"), "G0");
        touch(&dir.path().join("b.gcode"), "G0");
        let manager = FileManager::new(dir.path()).with_extensions([".NC"]);
        let files = manager.list_files(false).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.nc");
    }
}
